//! Webhook topics
//!
//! The set of topics the service handles is closed: adding a topic means
//! adding a variant here, and every `match` over [`Topic`] in the executor
//! stops compiling until the new topic has a handler.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WebhookError;

/// Webhook topics we handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    /// Inventory level changed at a location
    #[serde(rename = "inventory_levels/update")]
    InventoryLevelsUpdate,
    /// New order placed
    #[serde(rename = "orders/create")]
    OrdersCreate,
    /// Product fields changed
    #[serde(rename = "products/update")]
    ProductsUpdate,
    /// GDPR: customer requested their data
    #[serde(rename = "customers/data_request")]
    CustomersDataRequest,
    /// GDPR: customer data must be erased
    #[serde(rename = "customers/redact")]
    CustomersRedact,
    /// GDPR: all shop data must be erased
    #[serde(rename = "shop/redact")]
    ShopRedact,
    /// The shop removed the app
    #[serde(rename = "app/uninstalled")]
    AppUninstalled,
}

impl Topic {
    /// Every handled topic
    pub const ALL: [Topic; 7] = [
        Topic::InventoryLevelsUpdate,
        Topic::OrdersCreate,
        Topic::ProductsUpdate,
        Topic::CustomersDataRequest,
        Topic::CustomersRedact,
        Topic::ShopRedact,
        Topic::AppUninstalled,
    ];

    /// Canonical wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::InventoryLevelsUpdate => "inventory_levels/update",
            Topic::OrdersCreate => "orders/create",
            Topic::ProductsUpdate => "products/update",
            Topic::CustomersDataRequest => "customers/data_request",
            Topic::CustomersRedact => "customers/redact",
            Topic::ShopRedact => "shop/redact",
            Topic::AppUninstalled => "app/uninstalled",
        }
    }

    /// Parse a topic, tolerating case and separator variants.
    ///
    /// `orders/create`, `orders.create`, `ORDERS_CREATE` and `orders-create`
    /// all resolve to [`Topic::OrdersCreate`].
    pub fn parse(raw: &str) -> Option<Topic> {
        let wanted = squash(raw);
        if wanted.is_empty() {
            return None;
        }
        Topic::ALL
            .iter()
            .copied()
            .find(|topic| squash(topic.as_str()) == wanted)
    }

    /// GDPR topics with regulatory deadlines
    pub fn is_compliance_critical(&self) -> bool {
        matches!(
            self,
            Topic::CustomersDataRequest | Topic::CustomersRedact | Topic::ShopRedact
        )
    }
}

/// Lower-case and drop every separator so variants compare equal
fn squash(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, '/' | '.' | '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = WebhookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::parse(s).ok_or_else(|| WebhookError::UnknownTopic(s.to_string()))
    }
}
