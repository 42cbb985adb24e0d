//! Webhook event envelope and typed payloads
//!
//! An [`Event`] is built once the signature has been verified and the topic
//! resolved; it is never mutated afterwards. [`EventPayload`] is the closed
//! set of typed bodies, one variant per [`Topic`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{WebhookError, WebhookResult};
use crate::model::ShopDomain;
use crate::webhooks::topic::Topic;

/// A verified inbound delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Resolved topic
    pub topic: Topic,
    /// Shop the delivery is for
    pub shop: ShopDomain,
    /// Provider delivery id, when supplied
    pub webhook_id: Option<String>,
    /// Raw JSON body
    pub payload: serde_json::Value,
    /// When the delivery reached us
    pub received_at: DateTime<Utc>,
    /// When the provider emitted the event, when supplied
    pub triggered_at: Option<DateTime<Utc>>,
    /// Always true for events that reach a handler
    pub signature_valid: bool,
}

impl Event {
    /// Ordering timestamp for last-write-wins.
    ///
    /// The payload's own timestamp wins, then the provider's triggered-at
    /// header, then our receive time.
    pub fn effective_at(&self, payload_time: Option<DateTime<Utc>>) -> DateTime<Utc> {
        payload_time
            .or(self.triggered_at)
            .unwrap_or(self.received_at)
    }

    /// Typed view of the payload
    pub fn typed_payload(&self) -> WebhookResult<EventPayload> {
        EventPayload::from_value(self.topic, &self.payload)
    }
}

/// Typed payload per topic
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// `inventory_levels/update`
    InventoryLevel(InventoryLevelPayload),
    /// `orders/create`
    Order(OrderPayload),
    /// `products/update`
    Product(ProductPayload),
    /// `customers/data_request`
    CustomerDataRequest(CustomerDataRequestPayload),
    /// `customers/redact`
    CustomerRedact(CustomerRedactPayload),
    /// `shop/redact`
    ShopRedact(ShopRedactPayload),
    /// `app/uninstalled`
    AppUninstalled(AppUninstalledPayload),
}

impl EventPayload {
    /// Parse raw bytes for a topic
    pub fn parse(topic: Topic, body: &[u8]) -> WebhookResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| WebhookError::validation(format!("malformed JSON: {e}")))?;
        Self::from_value(topic, &value)
    }

    /// Interpret an already-parsed body for a topic
    pub fn from_value(topic: Topic, value: &serde_json::Value) -> WebhookResult<Self> {
        fn typed<T: serde::de::DeserializeOwned>(
            topic: Topic,
            value: &serde_json::Value,
        ) -> WebhookResult<T> {
            T::deserialize(value)
                .map_err(|e| WebhookError::validation(format!("invalid {topic} payload: {e}")))
        }

        if !value.is_object() {
            return Err(WebhookError::validation(format!(
                "{topic} payload must be a JSON object"
            )));
        }

        let payload = match topic {
            Topic::InventoryLevelsUpdate => EventPayload::InventoryLevel(typed(topic, value)?),
            Topic::OrdersCreate => EventPayload::Order(typed(topic, value)?),
            Topic::ProductsUpdate => EventPayload::Product(typed(topic, value)?),
            Topic::CustomersDataRequest => {
                EventPayload::CustomerDataRequest(typed(topic, value)?)
            }
            Topic::CustomersRedact => EventPayload::CustomerRedact(typed(topic, value)?),
            Topic::ShopRedact => EventPayload::ShopRedact(typed(topic, value)?),
            Topic::AppUninstalled => EventPayload::AppUninstalled(typed(topic, value)?),
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Shop domain carried inside the signed body, if the topic has one
    pub fn declared_shop(&self) -> Option<&str> {
        match self {
            EventPayload::CustomerDataRequest(p) => p.shop_domain.as_deref(),
            EventPayload::CustomerRedact(p) => p.shop_domain.as_deref(),
            EventPayload::ShopRedact(p) => p.shop_domain.as_deref(),
            EventPayload::AppUninstalled(p) => p.myshopify_domain.as_deref(),
            EventPayload::InventoryLevel(_)
            | EventPayload::Order(_)
            | EventPayload::Product(_) => None,
        }
    }

    fn validate(&self) -> WebhookResult<()> {
        match self {
            EventPayload::Order(order) => {
                if let Some(line) = order.line_items.iter().find(|l| l.quantity == 0) {
                    return Err(WebhookError::validation(format!(
                        "line item {} has zero quantity",
                        line.id
                    )));
                }
                if order.currency.trim().is_empty() {
                    return Err(WebhookError::validation("order currency is empty"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// `inventory_levels/update` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryLevelPayload {
    /// Inventory item whose level changed
    pub inventory_item_id: i64,
    /// Location of the level
    #[serde(default)]
    pub location_id: Option<i64>,
    /// New available quantity; `null` when untracked
    #[serde(default)]
    pub available: Option<i64>,
    /// When the level changed
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Customer reference embedded in several payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRef {
    /// Customer id
    pub id: i64,
    /// Customer email
    #[serde(default)]
    pub email: Option<String>,
}

/// `orders/create` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    /// Order id
    pub id: i64,
    /// Presentment currency
    pub currency: String,
    /// Purchaser email
    #[serde(default)]
    pub email: Option<String>,
    /// Purchasing customer
    #[serde(default)]
    pub customer: Option<CustomerRef>,
    /// Line items
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

/// Order line item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// Line item id
    pub id: i64,
    /// Product id; absent for custom items
    #[serde(default)]
    pub product_id: Option<i64>,
    /// Variant id
    #[serde(default)]
    pub variant_id: Option<i64>,
    /// Units ordered
    pub quantity: u32,
    /// Unit price, decimal string
    pub price: Decimal,
    /// Cart attributes attached to the line
    #[serde(default)]
    pub properties: Vec<LineItemProperty>,
}

impl LineItem {
    /// Value of a line property, as a string
    pub fn property(&self, name: &str) -> Option<String> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| match &p.value {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|v| !v.trim().is_empty())
    }
}

/// Name/value line property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItemProperty {
    /// Property name
    pub name: String,
    /// Property value
    #[serde(default)]
    pub value: serde_json::Value,
}

/// `products/update` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPayload {
    /// Product id
    pub id: i64,
    /// Title
    pub title: String,
    /// URL handle
    #[serde(default)]
    pub handle: Option<String>,
    /// When the product changed
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Variants with their prices
    #[serde(default)]
    pub variants: Vec<ProductVariant>,
}

/// Product variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductVariant {
    /// Variant id
    pub id: i64,
    /// Unit price
    #[serde(default)]
    pub price: Option<Decimal>,
    /// Inventory item backing the variant
    #[serde(default)]
    pub inventory_item_id: Option<i64>,
}

/// Data request reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequestRef {
    /// Request id
    pub id: i64,
}

/// `customers/data_request` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerDataRequestPayload {
    /// Shop id
    #[serde(default)]
    pub shop_id: Option<i64>,
    /// Shop domain as sent in the body
    #[serde(default)]
    pub shop_domain: Option<String>,
    /// Customer whose data is requested
    pub customer: CustomerRef,
    /// Orders the customer asked about
    #[serde(default)]
    pub orders_requested: Vec<i64>,
    /// Request reference
    #[serde(default)]
    pub data_request: Option<DataRequestRef>,
}

/// `customers/redact` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRedactPayload {
    /// Shop id
    #[serde(default)]
    pub shop_id: Option<i64>,
    /// Shop domain as sent in the body
    #[serde(default)]
    pub shop_domain: Option<String>,
    /// Customer to erase
    pub customer: CustomerRef,
    /// Orders to redact
    #[serde(default)]
    pub orders_to_redact: Vec<i64>,
}

/// `shop/redact` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShopRedactPayload {
    /// Shop id
    #[serde(default)]
    pub shop_id: Option<i64>,
    /// Shop domain as sent in the body
    #[serde(default)]
    pub shop_domain: Option<String>,
}

/// `app/uninstalled` body (the shop object)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppUninstalledPayload {
    /// Shop id
    #[serde(default)]
    pub id: Option<i64>,
    /// Shop's myshopify domain
    #[serde(default)]
    pub myshopify_domain: Option<String>,
}
