//! Shop-scoped domain rows
//!
//! These are the records the webhook handlers read and write. Every row
//! carries the [`ShopDomain`] that owns it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Tenant identifier (`example.myshopify.com`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShopDomain(String);

impl ShopDomain {
    /// Validate and normalize a shop domain
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        let valid = !normalized.is_empty()
            && normalized.len() <= 255
            && normalized.contains('.')
            && !normalized.starts_with('.')
            && !normalized.ends_with('.')
            && normalized
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        valid.then_some(Self(normalized))
    }

    /// Domain as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShopDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ShopDomain {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ShopDomain::parse(s)
            .ok_or_else(|| StoreError::Validation(format!("invalid shop domain: {s}")))
    }
}

/// Exact decimal amount in one currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// Amount in major units
    pub amount: Decimal,
    /// ISO 4217 code, upper-case
    pub currency: String,
}

impl Money {
    /// Create an amount in the given currency
    pub fn new(amount: Decimal, currency: impl AsRef<str>) -> Self {
        Self {
            amount,
            currency: currency.as_ref().trim().to_ascii_uppercase(),
        }
    }

    /// Zero in the given currency
    pub fn zero(currency: impl AsRef<str>) -> Self {
        Self::new(Decimal::ZERO, currency)
    }

    /// Add two amounts; currencies must match
    pub fn checked_add(&self, other: &Money) -> Option<Money> {
        if self.currency != other.currency {
            return None;
        }
        self.amount
            .checked_add(other.amount)
            .map(|amount| Money::new(amount, &self.currency))
    }

    /// Multiply by a quantity
    pub fn times(&self, quantity: u32) -> Option<Money> {
        self.amount
            .checked_mul(Decimal::from(quantity))
            .map(|amount| Money::new(amount, &self.currency))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// An installed shop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shop {
    /// Tenant identifier
    pub domain: ShopDomain,
    /// When the app was installed
    pub installed_at: DateTime<Utc>,
    /// Set when `app/uninstalled` arrives
    pub uninstalled_at: Option<DateTime<Utc>>,
}

impl Shop {
    /// Whether the app is currently installed
    pub fn is_installed(&self) -> bool {
        self.uninstalled_at.is_none()
    }
}

/// Per-shop app settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopSettings {
    /// Owning shop
    pub shop: ShopDomain,
    /// Whether purchasers may attach gift messages
    pub gift_messages_enabled: bool,
    /// Default registry currency
    pub currency: String,
}

/// Registry lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryStatus {
    /// Accepting purchases
    Active,
    /// Closed by the owner
    Archived,
}

/// A gift registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    /// Registry id, as tagged on order line items
    pub id: String,
    /// Owning shop
    pub shop: ShopDomain,
    /// Customer who owns the registry
    pub customer_id: Option<i64>,
    /// Owner contact email
    pub customer_email: Option<String>,
    /// Display title
    pub title: String,
    /// Total value of recorded purchases
    pub purchased_value: Money,
    /// Lifecycle state
    pub status: RegistryStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification
    pub updated_at: DateTime<Utc>,
}

/// Availability of a registry item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// In stock and still wanted
    Available,
    /// Out of stock
    Unavailable,
    /// Requested quantity fully purchased
    Purchased,
}

/// A product wished for on a registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryItem {
    /// Item id
    pub id: String,
    /// Parent registry
    pub registry_id: String,
    /// Owning shop
    pub shop: ShopDomain,
    /// Platform product id
    pub product_id: i64,
    /// Platform variant id
    pub variant_id: Option<i64>,
    /// Inventory item backing the variant
    pub inventory_item_id: Option<i64>,
    /// Cached product title
    pub product_title: String,
    /// Cached product handle
    pub product_handle: Option<String>,
    /// Cached unit price
    pub price: Option<Decimal>,
    /// How many the registry owner wants
    pub quantity_requested: u32,
    /// How many have been bought
    pub quantity_purchased: u32,
    /// Last known stock level
    pub inventory_quantity: Option<i64>,
    /// Availability
    pub status: ItemStatus,
    /// Timestamp of the inventory event last applied
    pub inventory_updated_at: Option<DateTime<Utc>>,
    /// Timestamp of the product event last applied
    pub product_updated_at: Option<DateTime<Utc>>,
}

impl RegistryItem {
    /// Whether the requested quantity has been bought
    pub fn is_fulfilled(&self) -> bool {
        self.quantity_purchased >= self.quantity_requested
    }
}

/// A purchase recorded from an order line item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    /// Purchase id
    pub id: String,
    /// Owning shop
    pub shop: ShopDomain,
    /// Registry credited
    pub registry_id: String,
    /// Item matched, if any
    pub item_id: Option<String>,
    /// Platform order id
    pub order_id: i64,
    /// Platform line-item id; unique per shop together with `order_id`
    pub line_item_id: i64,
    /// Purchasing customer; cleared on customer redaction
    pub purchaser_id: Option<i64>,
    /// Purchaser email; cleared on customer redaction
    pub purchaser_email: Option<String>,
    /// Units bought
    pub quantity: u32,
    /// Unit price
    pub unit_price: Money,
    /// Encrypted gift message (`v1:` + base64)
    pub gift_message: Option<String>,
    /// When the purchase was recorded
    pub created_at: DateTime<Utc>,
}
