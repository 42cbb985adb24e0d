//! Topic handlers
//!
//! Each handler runs inside one [`ShopTx`] and returns an
//! [`ExecutionReport`] describing what it changed. Handlers never commit or
//! roll back themselves; returning `Err` discards everything they wrote.
//!
//! Handlers are written to tolerate re-delivery and reordering:
//!
//! - purchases are keyed by order and line-item id before any counter moves
//! - inventory and product refreshes are last-write-wins on the event's own
//!   timestamp
//! - data export jobs are deduplicated by data-request id

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::{mask_email, mask_id, redacted_shop_id, AuditOutcome};
use crate::crypto::{normalize_gift_message, GiftMessageCipher};
use crate::error::{WebhookError, WebhookResult};
use crate::jobs::{JobKind, JobRecord, RetryPolicy};
use crate::model::{ItemStatus, Money, Purchase, Registry};
use crate::store::ShopTx;
use crate::webhooks::events::{
    AppUninstalledPayload, CustomerDataRequestPayload, CustomerRedactPayload, Event,
    EventPayload, InventoryLevelPayload, OrderPayload, ProductPayload, ShopRedactPayload,
};

/// Line property naming the registry credited by a purchase
pub const PROP_REGISTRY_ID: &str = "_registry_id";
/// Line property naming the registry item bought
pub const PROP_REGISTRY_ITEM_ID: &str = "_registry_item_id";
/// Line property carrying the purchaser's gift message
pub const PROP_GIFT_MESSAGE: &str = "_gift_message";

/// Priority of GDPR export jobs
pub const EXPORT_JOB_PRIORITY: i32 = 10;

/// What a handler did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    /// Kind of resource touched
    pub resource: &'static str,
    /// Id of the resource touched
    pub resource_id: Option<String>,
    /// Success, or skipped when nothing applied
    pub outcome: AuditOutcome,
    /// Counts and masked identifiers for the audit trail
    pub metadata: serde_json::Value,
}

impl ExecutionReport {
    fn new(resource: &'static str, resource_id: Option<String>, metadata: serde_json::Value) -> Self {
        Self {
            resource,
            resource_id,
            outcome: AuditOutcome::Success,
            metadata,
        }
    }

    fn skipped_when(mut self, skipped: bool) -> Self {
        if skipped {
            self.outcome = AuditOutcome::Skipped;
        }
        self
    }
}

/// Everything a handler needs besides the transaction
pub struct EffectContext<'a> {
    /// Event being handled
    pub event: &'a Event,
    /// Gift message cipher
    pub cipher: &'a GiftMessageCipher,
    /// Policy for jobs the handler enqueues
    pub compliance_retry: &'a RetryPolicy,
    /// Wall clock for this run
    pub now: DateTime<Utc>,
}

/// Run the handler for `payload`
pub fn apply(
    tx: &mut ShopTx<'_>,
    ctx: &EffectContext<'_>,
    payload: &EventPayload,
) -> WebhookResult<ExecutionReport> {
    match payload {
        EventPayload::InventoryLevel(p) => sync_inventory(tx, ctx, p),
        EventPayload::Order(p) => record_purchases(tx, ctx, p),
        EventPayload::Product(p) => refresh_products(tx, ctx, p),
        EventPayload::CustomerDataRequest(p) => enqueue_data_export(tx, ctx, p),
        EventPayload::CustomerRedact(p) => redact_customer(tx, p),
        EventPayload::ShopRedact(p) => redact_shop(tx, p),
        EventPayload::AppUninstalled(p) => mark_uninstalled(tx, ctx, p),
    }
}

/// Resource label used in audit records for a payload's topic
pub fn resource_for(topic: crate::webhooks::topic::Topic) -> &'static str {
    use crate::webhooks::topic::Topic;
    match topic {
        Topic::InventoryLevelsUpdate => "inventory_item",
        Topic::OrdersCreate => "order",
        Topic::ProductsUpdate => "product",
        Topic::CustomersDataRequest | Topic::CustomersRedact => "customer",
        Topic::ShopRedact | Topic::AppUninstalled => "shop",
    }
}

/// Find-or-create the shop row and report whether the app is installed
fn ensure_installed(tx: &mut ShopTx<'_>, now: DateTime<Utc>) -> bool {
    tx.upsert_shop(now).is_installed()
}

fn uninstalled_report(resource: &'static str, resource_id: Option<String>) -> ExecutionReport {
    ExecutionReport::new(resource, resource_id, json!({"reason": "shop_uninstalled"}))
        .skipped_when(true)
}

// -- inventory_levels/update -------------------------------------------------

fn sync_inventory(
    tx: &mut ShopTx<'_>,
    ctx: &EffectContext<'_>,
    p: &InventoryLevelPayload,
) -> WebhookResult<ExecutionReport> {
    let resource_id = Some(p.inventory_item_id.to_string());
    if !ensure_installed(tx, ctx.now) {
        return Ok(uninstalled_report("inventory_item", resource_id));
    }

    let at = ctx.event.effective_at(p.updated_at);
    let mut updated = 0usize;
    let mut stale = 0usize;
    let mut unavailable = 0usize;

    for item in tx
        .items_mut()
        .filter(|i| i.inventory_item_id == Some(p.inventory_item_id))
    {
        if item.inventory_updated_at.is_some_and(|last| last > at) {
            stale += 1;
            continue;
        }

        item.inventory_quantity = p.available;
        item.inventory_updated_at = Some(at);

        match p.available {
            Some(quantity) if quantity <= 0 => {
                // A fully bought item keeps its purchased status
                if !item.is_fulfilled() {
                    item.status = ItemStatus::Unavailable;
                    unavailable += 1;
                }
            }
            Some(_) if item.status == ItemStatus::Unavailable => {
                item.status = if item.is_fulfilled() {
                    ItemStatus::Purchased
                } else {
                    ItemStatus::Available
                };
            }
            _ => {}
        }
        updated += 1;
    }

    if stale > 0 {
        debug!(inventory_item_id = p.inventory_item_id, stale, "Skipped stale inventory update");
    }

    Ok(ExecutionReport::new(
        "inventory_item",
        resource_id,
        json!({
            "available": p.available,
            "location_id": p.location_id,
            "items_updated": updated,
            "items_unavailable": unavailable,
            "stale_skipped": stale,
            "effective_at": at.to_rfc3339(),
        }),
    )
    .skipped_when(updated == 0))
}

// -- orders/create -----------------------------------------------------------

fn record_purchases(
    tx: &mut ShopTx<'_>,
    ctx: &EffectContext<'_>,
    order: &OrderPayload,
) -> WebhookResult<ExecutionReport> {
    let resource_id = Some(order.id.to_string());
    if !ensure_installed(tx, ctx.now) {
        return Ok(uninstalled_report("order", resource_id));
    }

    let shop = tx.shop().clone();
    let gift_messages_enabled = tx.settings().map_or(true, |s| s.gift_messages_enabled);
    let purchaser_id = order.customer.as_ref().map(|c| c.id);
    let purchaser_email = order
        .email
        .clone()
        .or_else(|| order.customer.as_ref().and_then(|c| c.email.clone()));

    let mut created = 0usize;
    let mut duplicates = 0usize;
    let mut unknown_registries = 0usize;
    let mut currency_mismatches = 0usize;
    let mut credited: Vec<String> = Vec::new();

    for line in &order.line_items {
        let Some(registry_id) = line.property(PROP_REGISTRY_ID) else {
            continue;
        };

        if tx.find_purchase_by_line_item(order.id, line.id).is_some() {
            duplicates += 1;
            continue;
        }

        if tx.registry(&registry_id).is_none() {
            warn!(order_id = order.id, line_item_id = line.id, "Line item references unknown registry");
            unknown_registries += 1;
            continue;
        }

        let item_id = match_item(tx, &registry_id, line.property(PROP_REGISTRY_ITEM_ID), line.variant_id);

        let gift_message = if gift_messages_enabled {
            line.property(PROP_GIFT_MESSAGE)
                .and_then(|raw| normalize_gift_message(&raw))
                .map(|message| ctx.cipher.encrypt(&message))
                .transpose()?
        } else {
            None
        };

        let unit_price = Money::new(line.price, &order.currency);
        let line_total = unit_price.times(line.quantity).ok_or_else(|| {
            WebhookError::validation(format!("line item {} total overflows", line.id))
        })?;

        tx.insert_purchase(Purchase {
            id: Uuid::new_v4().to_string(),
            shop: shop.clone(),
            registry_id: registry_id.clone(),
            item_id: item_id.clone(),
            order_id: order.id,
            line_item_id: line.id,
            purchaser_id,
            purchaser_email: purchaser_email.clone(),
            quantity: line.quantity,
            unit_price,
            gift_message,
            created_at: ctx.now,
        })?;

        if let Some(registry) = tx.registry_mut(&registry_id) {
            match registry.purchased_value.checked_add(&line_total) {
                Some(total) => {
                    registry.purchased_value = total;
                    registry.updated_at = ctx.now;
                }
                None => {
                    warn!(
                        order_id = order.id,
                        registry_currency = %registry.purchased_value.currency,
                        order_currency = %line_total.currency,
                        "Currency mismatch; purchased value not incremented"
                    );
                    currency_mismatches += 1;
                }
            }
        }

        if let Some(item) = item_id.as_deref().and_then(|id| tx.item_mut(id)) {
            item.quantity_purchased = item.quantity_purchased.saturating_add(line.quantity);
            if item.is_fulfilled() {
                item.status = ItemStatus::Purchased;
            }
        }

        credited.push(registry_id);
        created += 1;
    }

    Ok(ExecutionReport::new(
        "order",
        resource_id,
        json!({
            "purchases_created": created,
            "duplicates_skipped": duplicates,
            "unknown_registries": unknown_registries,
            "currency_mismatches": currency_mismatches,
            "registries": credited,
            "purchaser_email": purchaser_email.as_deref().map(mask_email),
        }),
    )
    .skipped_when(created == 0))
}

/// Explicit item id first (if it belongs to the registry), then variant match
fn match_item(
    tx: &ShopTx<'_>,
    registry_id: &str,
    explicit: Option<String>,
    variant_id: Option<i64>,
) -> Option<String> {
    explicit
        .filter(|id| tx.item(id).is_some_and(|i| i.registry_id == registry_id))
        .or_else(|| {
            let variant_id = variant_id?;
            tx.items()
                .find(|i| i.registry_id == registry_id && i.variant_id == Some(variant_id))
                .map(|i| i.id.clone())
        })
}

// -- products/update ---------------------------------------------------------

fn refresh_products(
    tx: &mut ShopTx<'_>,
    ctx: &EffectContext<'_>,
    p: &ProductPayload,
) -> WebhookResult<ExecutionReport> {
    let resource_id = Some(p.id.to_string());
    if !ensure_installed(tx, ctx.now) {
        return Ok(uninstalled_report("product", resource_id));
    }

    let at = ctx.event.effective_at(p.updated_at);
    let mut refreshed = 0usize;
    let mut stale = 0usize;

    for item in tx.items_mut().filter(|i| i.product_id == p.id) {
        if item.product_updated_at.is_some_and(|last| last > at) {
            stale += 1;
            continue;
        }

        item.product_title = p.title.clone();
        if p.handle.is_some() {
            item.product_handle = p.handle.clone();
        }

        let variant = match item.variant_id {
            Some(variant_id) => p.variants.iter().find(|v| v.id == variant_id),
            None if p.variants.len() == 1 => p.variants.first(),
            None => None,
        };
        if let Some(variant) = variant {
            if variant.price.is_some() {
                item.price = variant.price;
            }
            if variant.inventory_item_id.is_some() {
                item.inventory_item_id = variant.inventory_item_id;
            }
        }

        item.product_updated_at = Some(at);
        refreshed += 1;
    }

    Ok(ExecutionReport::new(
        "product",
        resource_id,
        json!({
            "items_refreshed": refreshed,
            "stale_skipped": stale,
            "effective_at": at.to_rfc3339(),
        }),
    )
    .skipped_when(refreshed == 0))
}

// -- customers/data_request --------------------------------------------------

fn enqueue_data_export(
    tx: &mut ShopTx<'_>,
    ctx: &EffectContext<'_>,
    p: &CustomerDataRequestPayload,
) -> WebhookResult<ExecutionReport> {
    let customer_id = p.customer.id;
    let request_id = p.data_request.as_ref().map(|r| r.id);

    let existing = tx
        .jobs()
        .find(|job| match &job.kind {
            JobKind::CustomerDataExport {
                data_request_id,
                customer_id: cid,
            } => match request_id {
                Some(_) => *data_request_id == request_id,
                None => *cid == customer_id && !job.status.is_terminal(),
            },
            JobKind::WebhookRetry { .. } => false,
        })
        .map(|job| job.id);

    let (job_id, deduplicated) = match existing {
        Some(id) => (id, true),
        None => {
            let job = JobRecord::new(
                tx.shop().clone(),
                JobKind::CustomerDataExport {
                    data_request_id: request_id,
                    customer_id,
                },
                json!({
                    "customer_id": customer_id,
                    "email": p.customer.email.as_deref().map(mask_email),
                    "orders_requested": p.orders_requested,
                }),
                ctx.compliance_retry.clone(),
                ctx.now,
            )
            .with_priority(EXPORT_JOB_PRIORITY);
            (tx.enqueue_job(job)?, false)
        }
    };

    Ok(ExecutionReport::new(
        "customer",
        Some(mask_id(&customer_id.to_string())),
        json!({
            "job_id": job_id.to_string(),
            "data_request_id": request_id,
            "deduplicated": deduplicated,
            "orders_requested": p.orders_requested.len(),
        }),
    ))
}

// -- customers/redact --------------------------------------------------------

fn redact_customer(
    tx: &mut ShopTx<'_>,
    p: &CustomerRedactPayload,
) -> WebhookResult<ExecutionReport> {
    let customer_id = p.customer.id;
    let email = p.customer.email.as_deref();
    let same_email = |candidate: Option<&str>| {
        matches!((email, candidate), (Some(a), Some(b)) if a.eq_ignore_ascii_case(b))
    };

    let owned = |r: &Registry| r.customer_id == Some(customer_id) || same_email(r.customer_email.as_deref());
    let deleted = tx.delete_registries_cascade(owned)?;

    let mut anonymized = 0usize;
    for purchase in tx.purchases_mut().filter(|purchase| {
        purchase.purchaser_id == Some(customer_id)
            || same_email(purchase.purchaser_email.as_deref())
            || p.orders_to_redact.contains(&purchase.order_id)
    }) {
        purchase.purchaser_id = None;
        purchase.purchaser_email = None;
        purchase.gift_message = None;
        anonymized += 1;
    }

    // Exports and queued retries hold copies of the same data
    let jobs_deleted = tx.delete_customer_jobs(customer_id, email, &p.orders_to_redact);

    Ok(ExecutionReport::new(
        "customer",
        Some(mask_id(&customer_id.to_string())),
        json!({
            "registries_deleted": deleted.registries,
            "items_deleted": deleted.items,
            "purchases_deleted": deleted.purchases,
            "purchases_anonymized": anonymized,
            "jobs_deleted": jobs_deleted,
            "email": email.map(mask_email),
        }),
    ))
}

// -- shop/redact -------------------------------------------------------------

fn redact_shop(tx: &mut ShopTx<'_>, p: &ShopRedactPayload) -> WebhookResult<ExecutionReport> {
    let deleted = tx.redact_shop()?;
    let fingerprint = redacted_shop_id(tx.shop());

    Ok(ExecutionReport::new(
        "shop",
        Some(fingerprint),
        json!({
            "shop_id": p.shop_id.map(|id| mask_id(&id.to_string())),
            "deleted": deleted,
            "rows_deleted": deleted.total(),
        }),
    ))
}

// -- app/uninstalled ---------------------------------------------------------

fn mark_uninstalled(
    tx: &mut ShopTx<'_>,
    ctx: &EffectContext<'_>,
    p: &AppUninstalledPayload,
) -> WebhookResult<ExecutionReport> {
    let at = ctx.event.effective_at(None);
    let shop = tx.upsert_shop(ctx.now);
    let already_uninstalled = !shop.is_installed();
    if !already_uninstalled {
        shop.uninstalled_at = Some(at);
    }

    let cancelled = tx.cancel_open_jobs(ctx.now);

    Ok(ExecutionReport::new(
        "shop",
        p.id.map(|id| id.to_string()),
        json!({
            "already_uninstalled": already_uninstalled,
            "jobs_cancelled": cancelled,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use crate::model::{ShopDomain, ShopSettings};
    use crate::store::fixtures::*;
    use crate::store::Tables;
    use crate::webhooks::topic::Topic;
    use chrono::Duration;
    use rust_decimal::Decimal;

    struct Harness {
        tables: Tables,
        shop: ShopDomain,
        cipher: GiftMessageCipher,
        policy: RetryPolicy,
    }

    impl Harness {
        fn new() -> Self {
            let shop = shop("effects.myshopify.com");
            let mut tables = Tables::default();
            {
                let mut tx = ShopTx::new(shop.clone(), &mut tables);
                tx.upsert_shop(Utc::now());
                tx.insert_registry(registry(&shop, "reg-1", 1)).unwrap();
                tx.insert_item(item(&shop, "item-1", "reg-1", 555)).unwrap();
                tx.insert_item(item(&shop, "item-2", "reg-1", 555)).unwrap();
            }
            Self {
                tables,
                shop,
                cipher: GiftMessageCipher::new([3u8; 32]),
                policy: RetryPolicy::compliance(),
            }
        }

        fn event(&self, topic: Topic, payload: serde_json::Value) -> Event {
            Event {
                topic,
                shop: self.shop.clone(),
                webhook_id: None,
                payload,
                received_at: Utc::now(),
                triggered_at: None,
                signature_valid: true,
            }
        }

        fn run(&mut self, event: &Event) -> WebhookResult<ExecutionReport> {
            let payload = event.typed_payload()?;
            let ctx = EffectContext {
                event,
                cipher: &self.cipher,
                compliance_retry: &self.policy,
                now: Utc::now(),
            };
            let mut tx = ShopTx::new(self.shop.clone(), &mut self.tables);
            apply(&mut tx, &ctx, &payload)
        }

        fn tx(&mut self) -> ShopTx<'_> {
            ShopTx::new(self.shop.clone(), &mut self.tables)
        }
    }

    #[test]
    fn test_zero_inventory_marks_unavailable() {
        let mut h = Harness::new();
        let event = h.event(
            Topic::InventoryLevelsUpdate,
            json!({"inventory_item_id": 555, "available": 0}),
        );
        let report = h.run(&event).unwrap();
        assert_eq!(report.metadata["items_updated"], 2);

        let tx = h.tx();
        assert!(tx
            .items()
            .all(|i| i.status == ItemStatus::Unavailable && i.inventory_quantity == Some(0)));
    }

    #[test]
    fn test_restock_marks_available() {
        let mut h = Harness::new();
        let out = h.event(
            Topic::InventoryLevelsUpdate,
            json!({"inventory_item_id": 555, "available": 0}),
        );
        h.run(&out).unwrap();
        let back = h.event(
            Topic::InventoryLevelsUpdate,
            json!({"inventory_item_id": 555, "available": 4}),
        );
        h.run(&back).unwrap();
        assert!(h.tx().items().all(|i| i.status == ItemStatus::Available));
    }

    #[test]
    fn test_stale_inventory_event_is_ignored() {
        let mut h = Harness::new();
        let newer = Utc::now();
        let older = newer - Duration::minutes(5);

        let first = h.event(
            Topic::InventoryLevelsUpdate,
            json!({"inventory_item_id": 555, "available": 3, "updated_at": newer.to_rfc3339()}),
        );
        h.run(&first).unwrap();

        let late = h.event(
            Topic::InventoryLevelsUpdate,
            json!({"inventory_item_id": 555, "available": 0, "updated_at": older.to_rfc3339()}),
        );
        let report = h.run(&late).unwrap();
        assert_eq!(report.outcome, AuditOutcome::Skipped);
        assert_eq!(report.metadata["stale_skipped"], 2);
        assert!(h.tx().items().all(|i| i.inventory_quantity == Some(3)));
    }

    #[test]
    fn test_unmatched_inventory_is_skipped() {
        let mut h = Harness::new();
        let event = h.event(
            Topic::InventoryLevelsUpdate,
            json!({"inventory_item_id": 999, "available": 0}),
        );
        assert_eq!(h.run(&event).unwrap().outcome, AuditOutcome::Skipped);
    }

    fn order_body(line_id: i64, quantity: u32, price: &str) -> serde_json::Value {
        json!({
            "id": 1001,
            "currency": "USD",
            "email": "buyer@example.com",
            "customer": {"id": 42},
            "line_items": [{
                "id": line_id,
                "product_id": 632910392,
                "variant_id": 808950810,
                "quantity": quantity,
                "price": price,
                "properties": [
                    {"name": "_registry_id", "value": "reg-1"},
                    {"name": "_registry_item_id", "value": "item-1"},
                    {"name": "_gift_message", "value": "Happy Birthday!"}
                ]
            }]
        })
    }

    #[test]
    fn test_order_records_purchase_once() {
        let mut h = Harness::new();
        let event = h.event(Topic::OrdersCreate, order_body(7, 2, "19.99"));

        let report = h.run(&event).unwrap();
        assert_eq!(report.metadata["purchases_created"], 1);
        assert_eq!(report.metadata["purchaser_email"], "bu***@example.com");

        // Re-running the same order is a no-op
        let again = h.run(&event).unwrap();
        assert_eq!(again.metadata["duplicates_skipped"], 1);
        assert_eq!(again.outcome, AuditOutcome::Skipped);

        let cipher = h.cipher.clone();
        let tx = h.tx();
        let purchases: Vec<_> = tx.purchases().collect();
        assert_eq!(purchases.len(), 1);
        let stored = purchases[0].gift_message.as_deref().unwrap();
        assert!(!stored.contains("Happy Birthday!"));
        assert_eq!(cipher.decrypt(stored).unwrap(), "Happy Birthday!");

        let registry = tx.registry("reg-1").unwrap();
        assert_eq!(registry.purchased_value.amount, Decimal::new(3998, 2));

        let item = tx.item("item-1").unwrap();
        assert_eq!(item.quantity_purchased, 2);
        assert_eq!(item.status, ItemStatus::Purchased);
    }

    #[test]
    fn test_order_variant_fallback_and_disabled_gift_messages() {
        let mut h = Harness::new();
        let s = h.shop.clone();
        h.tx()
            .upsert_settings(ShopSettings {
                shop: s,
                gift_messages_enabled: false,
                currency: "USD".into(),
            })
            .unwrap();

        let mut body = order_body(8, 1, "5.00");
        body["line_items"][0]["properties"] = json!([
            {"name": "_registry_id", "value": "reg-1"},
            {"name": "_gift_message", "value": "hi"}
        ]);
        let event = h.event(Topic::OrdersCreate, body);
        h.run(&event).unwrap();

        let tx = h.tx();
        let purchase = tx.purchases().next().unwrap();
        assert!(purchase.gift_message.is_none());
        // item-1 is the first item with the matching variant
        assert_eq!(purchase.item_id.as_deref(), Some("item-1"));
    }

    #[test]
    fn test_order_currency_mismatch_skips_increment() {
        let mut h = Harness::new();
        let mut body = order_body(9, 1, "10.00");
        body["currency"] = json!("EUR");
        let event = h.event(Topic::OrdersCreate, body);

        let report = h.run(&event).unwrap();
        assert_eq!(report.metadata["currency_mismatches"], 1);
        assert_eq!(
            h.tx().registry("reg-1").unwrap().purchased_value.amount,
            Decimal::ZERO
        );
    }

    #[test]
    fn test_order_for_unknown_registry() {
        let mut h = Harness::new();
        let mut body = order_body(10, 1, "1.00");
        body["line_items"][0]["properties"][0]["value"] = json!("reg-elsewhere");
        let event = h.event(Topic::OrdersCreate, body);

        let report = h.run(&event).unwrap();
        assert_eq!(report.metadata["unknown_registries"], 1);
        assert_eq!(h.tx().purchases().count(), 0);
    }

    #[test]
    fn test_product_refresh() {
        let mut h = Harness::new();
        let event = h.event(
            Topic::ProductsUpdate,
            json!({
                "id": 632910392,
                "title": "IPod Nano - 16GB",
                "handle": "ipod-nano-16",
                "variants": [{"id": 808950810, "price": "249.00"}]
            }),
        );
        let report = h.run(&event).unwrap();
        assert_eq!(report.metadata["items_refreshed"], 2);

        let tx = h.tx();
        let item = tx.item("item-2").unwrap();
        assert_eq!(item.product_title, "IPod Nano - 16GB");
        assert_eq!(item.product_handle.as_deref(), Some("ipod-nano-16"));
        assert_eq!(item.price, Some(Decimal::new(24900, 2)));
    }

    #[test]
    fn test_data_request_deduplicated() {
        let mut h = Harness::new();
        let event = h.event(
            Topic::CustomersDataRequest,
            json!({"customer": {"id": 1, "email": "owner1@example.com"}, "data_request": {"id": 9999}}),
        );

        let first = h.run(&event).unwrap();
        assert_eq!(first.metadata["deduplicated"], false);
        let second = h.run(&event).unwrap();
        assert_eq!(second.metadata["deduplicated"], true);
        assert_eq!(first.metadata["job_id"], second.metadata["job_id"]);

        let tx = h.tx();
        let jobs: Vec<_> = tx.jobs().collect();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].priority, EXPORT_JOB_PRIORITY);
        assert_eq!(jobs[0].retry_policy, RetryPolicy::compliance());
    }

    #[test]
    fn test_customer_redact() {
        let mut h = Harness::new();
        let s = h.shop.clone();
        {
            let mut tx = h.tx();
            tx.insert_registry(registry(&s, "reg-other", 2)).unwrap();
            // Customer 1 bought from someone else's registry
            let mut bought = purchase(&s, "p-1", "reg-other", None);
            bought.purchaser_id = Some(1);
            tx.insert_purchase(bought).unwrap();
        }

        let event = h.event(
            Topic::CustomersRedact,
            json!({"customer": {"id": 1, "email": "owner1@example.com"}, "orders_to_redact": []}),
        );
        let report = h.run(&event).unwrap();
        assert_eq!(report.metadata["registries_deleted"], 1);
        assert_eq!(report.metadata["items_deleted"], 2);
        assert_eq!(report.metadata["purchases_anonymized"], 1);
        assert_eq!(report.resource_id.as_deref(), Some("****"));

        let tx = h.tx();
        assert!(tx.registry("reg-1").is_none());
        assert!(tx.registry("reg-other").is_some());
        let purchase = tx.purchases().next().unwrap();
        assert_eq!(purchase.purchaser_id, None);
        assert_eq!(purchase.purchaser_email, None);
    }

    #[test]
    fn test_shop_redact_removes_all_rows() {
        let mut h = Harness::new();
        let event = h.event(Topic::ShopRedact, json!({"shop_id": 954889, "shop_domain": "effects.myshopify.com"}));
        let report = h.run(&event).unwrap();
        assert_eq!(report.metadata["rows_deleted"], 4);
        assert_eq!(h.tx().row_count(), 0);
    }

    #[test]
    fn test_customer_redact_deletes_export_jobs() {
        let mut h = Harness::new();
        let request = h.event(
            Topic::CustomersDataRequest,
            json!({"customer": {"id": 1, "email": "owner1@example.com"}, "data_request": {"id": 5}}),
        );
        h.run(&request).unwrap();
        let payload = h.tx().jobs().next().unwrap().payload.clone();
        assert_eq!(payload["email"], mask_email("owner1@example.com"));

        let redact = h.event(
            Topic::CustomersRedact,
            json!({"customer": {"id": 1, "email": "owner1@example.com"}, "orders_to_redact": []}),
        );
        let report = h.run(&redact).unwrap();
        assert_eq!(report.metadata["jobs_deleted"], 1);
        assert_eq!(h.tx().jobs().count(), 0);
    }

    #[test]
    fn test_uninstall_cancels_open_jobs() {
        let mut h = Harness::new();
        let request = h.event(
            Topic::CustomersDataRequest,
            json!({"customer": {"id": 1}, "data_request": {"id": 1}}),
        );
        h.run(&request).unwrap();

        let event = h.event(Topic::AppUninstalled, json!({"id": 1, "myshopify_domain": "effects.myshopify.com"}));
        let report = h.run(&event).unwrap();
        assert_eq!(report.metadata["jobs_cancelled"], 1);

        let tx = h.tx();
        assert!(!tx.get_shop().unwrap().is_installed());
        assert!(tx.jobs().all(|j| j.status == JobStatus::Cancelled));
    }

    #[test]
    fn test_events_after_uninstall_are_skipped() {
        let mut h = Harness::new();
        let uninstall = h.event(Topic::AppUninstalled, json!({}));
        h.run(&uninstall).unwrap();

        let event = h.event(
            Topic::InventoryLevelsUpdate,
            json!({"inventory_item_id": 555, "available": 0}),
        );
        let report = h.run(&event).unwrap();
        assert_eq!(report.outcome, AuditOutcome::Skipped);
        assert!(h.tx().items().all(|i| i.status == ItemStatus::Available));
    }
}
