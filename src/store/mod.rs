//! Persistence
//!
//! The pipeline's contract with the relational store:
//!
//! - multi-statement atomic transactions ([`Store::transaction`])
//! - find-or-create / upsert helpers on [`ShopTx`]
//! - cascading deletes that respect foreign-key order ([`ShopTx::redact_shop`])
//!
//! A transaction is always scoped to one shop. [`ShopTx`] only ever reads or
//! writes rows owned by that shop, so a handler cannot touch another tenant's
//! data even by mistake.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audit::{redacted_shop_id, AuditRecord};
use crate::error::{StoreError, StoreResult};
use crate::jobs::{JobId, JobKind, JobRecord, JobStatus};
use crate::model::{Purchase, Registry, RegistryItem, Shop, ShopDomain, ShopSettings};
use crate::webhooks::topic::Topic;

pub use memory::MemoryStore;

/// Transactional store used by the executor
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Run `f` atomically against `shop`'s rows.
    ///
    /// Everything `f` writes is committed if it returns `Ok` and discarded if
    /// it returns `Err`. Failing to open or commit the transaction surfaces
    /// as `E::from(StoreError)`.
    async fn transaction<T, E, F>(&self, shop: &ShopDomain, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&mut ShopTx<'t>) -> Result<T, E> + Send,
        T: Send,
        E: From<StoreError> + Send;

    /// Claim up to `limit` due pending jobs, highest priority first.
    ///
    /// Jobs still `running` after [`JOB_LEASE`](crate::jobs::JOB_LEASE) are
    /// claimed again. Claimed jobs are moved to `running` and their attempt
    /// count is incremented before they are returned.
    async fn claim_due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<JobRecord>>;

    /// Persist a job's new state, returning the status actually stored.
    ///
    /// A row cancelled while the job ran stays `cancelled` when the job
    /// comes back for a retry.
    async fn save_job(&self, job: &JobRecord) -> StoreResult<JobStatus>;

    /// Whether an audit record with this idempotency key was written for
    /// `shop` at or after `since`.
    ///
    /// Every delivery that reached the executor left one, together with any
    /// job it enqueued, so this is the durable duplicate check.
    async fn idempotency_key_seen(
        &self,
        shop: &ShopDomain,
        key: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// List jobs, newest first
    async fn list_jobs(
        &self,
        shop: Option<&ShopDomain>,
        status: Option<JobStatus>,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>>;

    /// List audit records, newest first
    async fn list_audit(&self, shop: Option<&str>, limit: usize) -> StoreResult<Vec<AuditRecord>>;

    /// Cheap connectivity check for readiness probes
    async fn ping(&self) -> StoreResult<()>;
}

/// Every table the service owns
#[derive(Debug, Clone, Default)]
pub struct Tables {
    shops: BTreeMap<ShopDomain, Shop>,
    settings: BTreeMap<ShopDomain, ShopSettings>,
    registries: BTreeMap<String, Registry>,
    items: BTreeMap<String, RegistryItem>,
    purchases: BTreeMap<String, Purchase>,
    audit: Vec<AuditRecord>,
    jobs: BTreeMap<JobId, JobRecord>,
}

/// Rows removed by a cascading delete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeletionCounts {
    /// Purchases removed
    pub purchases: usize,
    /// Registry items removed
    pub items: usize,
    /// Registries removed
    pub registries: usize,
    /// Audit records removed
    pub audit_records: usize,
    /// Settings rows removed
    pub settings: usize,
    /// Jobs removed
    pub jobs: usize,
    /// Shop rows removed
    pub shops: usize,
}

impl DeletionCounts {
    /// Sum of all rows removed
    pub fn total(&self) -> usize {
        self.purchases
            + self.items
            + self.registries
            + self.audit_records
            + self.settings
            + self.jobs
            + self.shops
    }
}

/// A transaction scoped to one shop
pub struct ShopTx<'t> {
    shop: ShopDomain,
    tables: &'t mut Tables,
}

impl<'t> ShopTx<'t> {
    pub(crate) fn new(shop: ShopDomain, tables: &'t mut Tables) -> Self {
        Self { shop, tables }
    }

    /// The tenant this transaction is scoped to
    pub fn shop(&self) -> &ShopDomain {
        &self.shop
    }

    fn owns(&self, shop: &ShopDomain) -> StoreResult<()> {
        if shop == &self.shop {
            Ok(())
        } else {
            Err(StoreError::Constraint(format!(
                "row belongs to {shop}, transaction is scoped to {}",
                self.shop
            )))
        }
    }

    // -- shops ---------------------------------------------------------------

    /// Find or create the shop row
    pub fn upsert_shop(&mut self, now: DateTime<Utc>) -> &mut Shop {
        self.tables
            .shops
            .entry(self.shop.clone())
            .or_insert_with(|| Shop {
                domain: self.shop.clone(),
                installed_at: now,
                uninstalled_at: None,
            })
    }

    /// The shop row, if any
    pub fn get_shop(&self) -> Option<&Shop> {
        self.tables.shops.get(&self.shop)
    }

    /// The shop's settings, if any
    pub fn settings(&self) -> Option<&ShopSettings> {
        self.tables.settings.get(&self.shop)
    }

    /// Insert or replace the shop's settings
    pub fn upsert_settings(&mut self, settings: ShopSettings) -> StoreResult<()> {
        self.owns(&settings.shop)?;
        self.tables.settings.insert(self.shop.clone(), settings);
        Ok(())
    }

    // -- registries ----------------------------------------------------------

    /// Insert a new registry
    pub fn insert_registry(&mut self, registry: Registry) -> StoreResult<()> {
        self.owns(&registry.shop)?;
        if self.tables.registries.contains_key(&registry.id) {
            return Err(StoreError::Constraint(format!(
                "registry {} already exists",
                registry.id
            )));
        }
        self.tables.registries.insert(registry.id.clone(), registry);
        Ok(())
    }

    /// Registry by id, only if owned by this shop
    pub fn registry(&self, id: &str) -> Option<&Registry> {
        self.tables
            .registries
            .get(id)
            .filter(|r| r.shop == self.shop)
    }

    /// Mutable registry by id, only if owned by this shop
    pub fn registry_mut(&mut self, id: &str) -> Option<&mut Registry> {
        let shop = &self.shop;
        self.tables
            .registries
            .get_mut(id)
            .filter(|r| &r.shop == shop)
    }

    /// All of this shop's registries
    pub fn registries(&self) -> impl Iterator<Item = &Registry> + '_ {
        self.tables
            .registries
            .values()
            .filter(move |r| r.shop == self.shop)
    }

    // -- items ---------------------------------------------------------------

    /// Insert a registry item; its registry must exist in this shop
    pub fn insert_item(&mut self, item: RegistryItem) -> StoreResult<()> {
        self.owns(&item.shop)?;
        if self.registry(&item.registry_id).is_none() {
            return Err(StoreError::Constraint(format!(
                "item {} references missing registry {}",
                item.id, item.registry_id
            )));
        }
        if self.tables.items.contains_key(&item.id) {
            return Err(StoreError::Constraint(format!(
                "item {} already exists",
                item.id
            )));
        }
        self.tables.items.insert(item.id.clone(), item);
        Ok(())
    }

    /// Item by id, only if owned by this shop
    pub fn item(&self, id: &str) -> Option<&RegistryItem> {
        self.tables.items.get(id).filter(|i| i.shop == self.shop)
    }

    /// Mutable item by id, only if owned by this shop
    pub fn item_mut(&mut self, id: &str) -> Option<&mut RegistryItem> {
        let shop = &self.shop;
        self.tables.items.get_mut(id).filter(|i| &i.shop == shop)
    }

    /// All of this shop's items
    pub fn items(&self) -> impl Iterator<Item = &RegistryItem> + '_ {
        self.tables
            .items
            .values()
            .filter(move |i| i.shop == self.shop)
    }

    /// All of this shop's items, mutable
    pub fn items_mut(&mut self) -> impl Iterator<Item = &mut RegistryItem> + '_ {
        let shop = &self.shop;
        self.tables
            .items
            .values_mut()
            .filter(move |i| &i.shop == shop)
    }

    // -- purchases -----------------------------------------------------------

    /// Existing purchase for an order line item
    pub fn find_purchase_by_line_item(&self, order_id: i64, line_item_id: i64) -> Option<&Purchase> {
        self.purchases()
            .find(|p| p.order_id == order_id && p.line_item_id == line_item_id)
    }

    /// Insert a purchase; `(order_id, line_item_id)` must be new and the
    /// registry (and item, when set) must exist in this shop
    pub fn insert_purchase(&mut self, purchase: Purchase) -> StoreResult<()> {
        self.owns(&purchase.shop)?;
        if self
            .find_purchase_by_line_item(purchase.order_id, purchase.line_item_id)
            .is_some()
        {
            return Err(StoreError::Constraint(format!(
                "purchase for order {} line {} already exists",
                purchase.order_id, purchase.line_item_id
            )));
        }
        if self.registry(&purchase.registry_id).is_none() {
            return Err(StoreError::Constraint(format!(
                "purchase references missing registry {}",
                purchase.registry_id
            )));
        }
        if let Some(item_id) = &purchase.item_id {
            if self.item(item_id).is_none() {
                return Err(StoreError::Constraint(format!(
                    "purchase references missing item {item_id}"
                )));
            }
        }
        self.tables.purchases.insert(purchase.id.clone(), purchase);
        Ok(())
    }

    /// All of this shop's purchases
    pub fn purchases(&self) -> impl Iterator<Item = &Purchase> + '_ {
        self.tables
            .purchases
            .values()
            .filter(move |p| p.shop == self.shop)
    }

    /// All of this shop's purchases, mutable
    pub fn purchases_mut(&mut self) -> impl Iterator<Item = &mut Purchase> + '_ {
        let shop = &self.shop;
        self.tables
            .purchases
            .values_mut()
            .filter(move |p| &p.shop == shop)
    }

    // -- deletes -------------------------------------------------------------

    fn delete_purchases_where(&mut self, pred: impl Fn(&Purchase) -> bool) -> usize {
        let shop = self.shop.clone();
        let before = self.tables.purchases.len();
        self.tables
            .purchases
            .retain(|_, p| !(p.shop == shop && pred(p)));
        before - self.tables.purchases.len()
    }

    fn delete_items_where(&mut self, pred: impl Fn(&RegistryItem) -> bool) -> StoreResult<usize> {
        let shop = self.shop.clone();
        let doomed: Vec<String> = self
            .tables
            .items
            .values()
            .filter(|i| i.shop == shop && pred(i))
            .map(|i| i.id.clone())
            .collect();
        if let Some(p) = self
            .tables
            .purchases
            .values()
            .find(|p| p.item_id.as_ref().is_some_and(|id| doomed.contains(id)))
        {
            return Err(StoreError::Constraint(format!(
                "purchase {} still references an item being deleted",
                p.id
            )));
        }
        for id in &doomed {
            self.tables.items.remove(id);
        }
        Ok(doomed.len())
    }

    fn delete_registries_where(&mut self, pred: impl Fn(&Registry) -> bool) -> StoreResult<usize> {
        let shop = self.shop.clone();
        let doomed: Vec<String> = self
            .tables
            .registries
            .values()
            .filter(|r| r.shop == shop && pred(r))
            .map(|r| r.id.clone())
            .collect();
        let referenced = self
            .tables
            .items
            .values()
            .map(|i| &i.registry_id)
            .chain(self.tables.purchases.values().map(|p| &p.registry_id))
            .find(|id| doomed.contains(*id));
        if let Some(id) = referenced {
            return Err(StoreError::Constraint(format!(
                "registry {id} still has dependent rows"
            )));
        }
        for id in &doomed {
            self.tables.registries.remove(id);
        }
        Ok(doomed.len())
    }

    /// Delete registries matching `pred` together with their items and
    /// purchases, children first
    pub fn delete_registries_cascade(
        &mut self,
        pred: impl Fn(&Registry) -> bool,
    ) -> StoreResult<DeletionCounts> {
        let ids: Vec<String> = self
            .registries()
            .filter(|r| pred(r))
            .map(|r| r.id.clone())
            .collect();

        let mut counts = DeletionCounts {
            purchases: self.delete_purchases_where(|p| ids.contains(&p.registry_id)),
            ..Default::default()
        };
        counts.items = self.delete_items_where(|i| ids.contains(&i.registry_id))?;
        counts.registries = self.delete_registries_where(|r| ids.contains(&r.id))?;
        Ok(counts)
    }

    /// Delete every row owned by this shop.
    ///
    /// Order: purchases, items, registries, then audit records, settings and
    /// jobs, and the shop row last.
    pub fn redact_shop(&mut self) -> StoreResult<DeletionCounts> {
        let mut counts = DeletionCounts {
            purchases: self.delete_purchases_where(|_| true),
            ..Default::default()
        };
        counts.items = self.delete_items_where(|_| true)?;
        counts.registries = self.delete_registries_where(|_| true)?;

        let shop_id = self.shop.as_str().to_string();
        let before = self.tables.audit.len();
        self.tables.audit.retain(|a| a.shop != shop_id);
        counts.audit_records = before - self.tables.audit.len();

        counts.settings = usize::from(self.tables.settings.remove(&self.shop).is_some());

        let shop = self.shop.clone();
        let before = self.tables.jobs.len();
        self.tables.jobs.retain(|_, j| j.shop != shop);
        counts.jobs = before - self.tables.jobs.len();

        counts.shops = usize::from(self.tables.shops.remove(&self.shop).is_some());
        Ok(counts)
    }

    /// Rows in any shop-scoped table that reference this shop
    pub fn row_count(&self) -> usize {
        let shop_id = self.shop.as_str();
        usize::from(self.get_shop().is_some())
            + usize::from(self.settings().is_some())
            + self.registries().count()
            + self.items().count()
            + self.purchases().count()
            + self.tables.audit.iter().filter(|a| a.shop == shop_id).count()
            + self.jobs().count()
    }

    // -- audit ---------------------------------------------------------------

    /// Append an audit record under this shop
    pub fn append_audit(&mut self, mut record: AuditRecord) {
        record.shop = self.shop.as_str().to_string();
        self.tables.audit.push(record);
    }

    /// Append an audit record under this shop's redacted fingerprint
    pub fn append_redacted_audit(&mut self, mut record: AuditRecord) {
        record.shop = redacted_shop_id(&self.shop);
        self.tables.audit.push(record);
    }

    /// This shop's audit records, oldest first
    pub fn audit(&self) -> impl Iterator<Item = &AuditRecord> + '_ {
        let shop_id = self.shop.as_str();
        self.tables.audit.iter().filter(move |a| a.shop == shop_id)
    }

    // -- jobs ----------------------------------------------------------------

    /// Enqueue a job for this shop
    pub fn enqueue_job(&mut self, job: JobRecord) -> StoreResult<JobId> {
        self.owns(&job.shop)?;
        let id = job.id;
        if self.tables.jobs.contains_key(&id) {
            return Err(StoreError::Constraint(format!("job {id} already exists")));
        }
        self.tables.jobs.insert(id, job);
        Ok(id)
    }

    /// This shop's jobs
    pub fn jobs(&self) -> impl Iterator<Item = &JobRecord> + '_ {
        self.tables
            .jobs
            .values()
            .filter(move |j| j.shop == self.shop)
    }

    /// Mark every pending or running job of this shop cancelled.
    ///
    /// A running job keeps running; when it saves its result the store only
    /// lets it complete or fail, never go back to pending.
    pub fn cancel_open_jobs(&mut self, now: DateTime<Utc>) -> usize {
        let shop = &self.shop;
        let mut cancelled = 0;
        for job in self
            .tables
            .jobs
            .values_mut()
            .filter(|j| &j.shop == shop && !j.status.is_terminal())
        {
            job.status = JobStatus::Cancelled;
            job.updated_at = now;
            cancelled += 1;
        }
        cancelled
    }

    /// Delete this shop's jobs that carry a customer's data.
    ///
    /// That is the customer's data exports, and retries whose event names the
    /// customer by id or email or is one of `orders`.
    pub fn delete_customer_jobs(
        &mut self,
        customer_id: i64,
        email: Option<&str>,
        orders: &[i64],
    ) -> usize {
        let shop = self.shop.clone();
        let before = self.tables.jobs.len();
        self.tables.jobs.retain(|_, job| {
            job.shop != shop || !job_references_customer(job, customer_id, email, orders)
        });
        before - self.tables.jobs.len()
    }
}

fn job_references_customer(
    job: &JobRecord,
    customer_id: i64,
    email: Option<&str>,
    orders: &[i64],
) -> bool {
    match &job.kind {
        JobKind::CustomerDataExport { customer_id: cid, .. } => *cid == customer_id,
        JobKind::WebhookRetry { topic } => {
            let order = *topic == Topic::OrdersCreate
                && job.payload["payload"]["id"]
                    .as_i64()
                    .is_some_and(|id| orders.contains(&id));
            order || mentions_customer(&job.payload, customer_id, email)
        }
    }
}

/// A `customer` object with this id, or any string equal to the email
fn mentions_customer(value: &serde_json::Value, customer_id: i64, email: Option<&str>) -> bool {
    use serde_json::Value;
    match value {
        Value::String(s) => email.is_some_and(|e| s.eq_ignore_ascii_case(e)),
        Value::Array(values) => values.iter().any(|v| mentions_customer(v, customer_id, email)),
        Value::Object(map) => {
            let customer = map
                .get("customer")
                .and_then(|c| c.get("id"))
                .and_then(Value::as_i64)
                == Some(customer_id);
            customer || map.values().any(|v| mentions_customer(v, customer_id, email))
        }
        _ => false,
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_tenant_isolation() {
        let mut tables = Tables::default();
        let a = shop("a.myshopify.com");
        let b = shop("b.myshopify.com");

        ShopTx::new(a.clone(), &mut tables)
            .insert_registry(registry(&a, "reg-a", 1))
            .unwrap();

        let mut tx_b = ShopTx::new(b.clone(), &mut tables);
        assert!(tx_b.registry("reg-a").is_none());
        assert!(tx_b.registry_mut("reg-a").is_none());
        assert_eq!(tx_b.registries().count(), 0);

        // Writing a row for another shop is rejected
        let err = tx_b.insert_registry(registry(&a, "reg-x", 2)).unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[test]
    fn test_item_requires_registry() {
        let mut tables = Tables::default();
        let s = shop("a.myshopify.com");
        let mut tx = ShopTx::new(s.clone(), &mut tables);
        let err = tx.insert_item(item(&s, "item-1", "missing", 7)).unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[test]
    fn test_duplicate_line_item_rejected() {
        let mut tables = Tables::default();
        let s = shop("a.myshopify.com");
        let mut tx = ShopTx::new(s.clone(), &mut tables);
        tx.insert_registry(registry(&s, "reg", 1)).unwrap();
        let mut first = purchase(&s, "p1", "reg", None);
        first.line_item_id = 77;
        tx.insert_purchase(first).unwrap();
        assert!(tx.find_purchase_by_line_item(1001, 77).is_some());

        let mut dup = purchase(&s, "p2", "reg", None);
        dup.line_item_id = 77;
        assert!(tx.insert_purchase(dup).is_err());
    }

    #[test]
    fn test_redact_shop_removes_everything_and_spares_neighbours() {
        let mut tables = Tables::default();
        let a = shop("a.myshopify.com");
        let b = shop("b.myshopify.com");

        for s in [&a, &b] {
            let mut tx = ShopTx::new(s.clone(), &mut tables);
            tx.upsert_shop(Utc::now());
            tx.insert_registry(registry(s, &format!("reg-{s}"), 1)).unwrap();
            tx.insert_item(item(s, &format!("item-{s}"), &format!("reg-{s}"), 5))
                .unwrap();
            tx.insert_purchase(purchase(
                s,
                &format!("p-{s}"),
                &format!("reg-{s}"),
                Some(&format!("item-{s}")),
            ))
            .unwrap();
        }

        let counts = ShopTx::new(a.clone(), &mut tables).redact_shop().unwrap();
        assert_eq!(counts.purchases, 1);
        assert_eq!(counts.items, 1);
        assert_eq!(counts.registries, 1);
        assert_eq!(counts.shops, 1);

        assert_eq!(ShopTx::new(a, &mut tables).row_count(), 0);
        assert_eq!(ShopTx::new(b, &mut tables).row_count(), 4);
    }

    #[test]
    fn test_delete_customer_jobs_spares_other_customers() {
        use crate::jobs::RetryPolicy;
        use serde_json::json;

        let mut tables = Tables::default();
        let s = shop("a.myshopify.com");
        let now = Utc::now();
        let job = |kind, payload| JobRecord::new(s.clone(), kind, payload, RetryPolicy::standard(), now);
        let retry = |topic| JobKind::WebhookRetry { topic };

        let mut tx = ShopTx::new(s.clone(), &mut tables);
        for record in [
            job(
                JobKind::CustomerDataExport { data_request_id: Some(1), customer_id: 8001 },
                json!({"customer_id": 8001}),
            ),
            job(
                retry(Topic::OrdersCreate),
                json!({"payload": {"id": 10, "customer": {"id": 8001}}}),
            ),
            job(
                retry(Topic::OrdersCreate),
                json!({"payload": {"id": 11, "email": "GRACE@example.com"}}),
            ),
            job(retry(Topic::OrdersCreate), json!({"payload": {"id": 12}})),
            job(
                retry(Topic::OrdersCreate),
                json!({"payload": {"id": 13, "customer": {"id": 9}}}),
            ),
            job(
                JobKind::CustomerDataExport { data_request_id: Some(2), customer_id: 9 },
                json!({"customer_id": 9}),
            ),
        ] {
            tx.enqueue_job(record).unwrap();
        }

        assert_eq!(tx.delete_customer_jobs(8001, Some("grace@example.com"), &[12]), 4);
        let left: Vec<_> = tx.jobs().map(|j| j.payload.to_string()).collect();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|p| !p.contains("8001")));
    }

    #[test]
    fn test_items_cannot_be_deleted_under_purchases() {
        let mut tables = Tables::default();
        let s = shop("a.myshopify.com");
        let mut tx = ShopTx::new(s.clone(), &mut tables);
        tx.insert_registry(registry(&s, "reg", 1)).unwrap();
        tx.insert_item(item(&s, "item", "reg", 5)).unwrap();
        tx.insert_purchase(purchase(&s, "p", "reg", Some("item"))).unwrap();

        assert!(tx.delete_items_where(|_| true).is_err());
        assert!(tx.delete_registries_where(|_| true).is_err());
    }
}
