//! Audit trail
//!
//! One [`AuditRecord`] is appended for every accepted webhook invocation,
//! whether the handler succeeded or failed. The [`AuditLogger`] builds the
//! record and emits a matching `tracing` line in which customer emails and
//! identifiers are partially masked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::model::ShopDomain;
use crate::webhooks::topic::Topic;

/// How an invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Handler effect committed
    Success,
    /// Handler failed; a retry job may have been enqueued
    Failure,
    /// Accepted but nothing to do (stale or unmatched event)
    Skipped,
}

impl AuditOutcome {
    /// Lower-case label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Skipped => "skipped",
        }
    }
}

/// Append-only audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Record id
    pub id: Uuid,
    /// What was attempted (`webhook.orders/create`)
    pub action: String,
    /// Kind of resource touched
    pub resource: String,
    /// Id of the resource touched
    pub resource_id: Option<String>,
    /// Owning shop, or its redacted fingerprint after `shop/redact`
    pub shop: String,
    /// Result
    pub outcome: AuditOutcome,
    /// Idempotency key of the delivery
    pub idempotency_key: Option<String>,
    /// Counts, ids and masked identifiers
    pub metadata: serde_json::Value,
    /// When the record was written
    pub timestamp: DateTime<Utc>,
}

/// Builds audit records and mirrors them to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditLogger;

impl AuditLogger {
    /// Create a logger
    pub fn new() -> Self {
        Self
    }

    /// Build a record for a webhook invocation
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        shop: &ShopDomain,
        topic: Topic,
        resource: &str,
        resource_id: Option<String>,
        outcome: AuditOutcome,
        idempotency_key: Option<&str>,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> AuditRecord {
        let record = AuditRecord {
            id: Uuid::new_v4(),
            action: format!("webhook.{topic}"),
            resource: resource.to_string(),
            resource_id,
            shop: shop.as_str().to_string(),
            outcome,
            idempotency_key: idempotency_key.map(str::to_string),
            metadata,
            timestamp: now,
        };
        self.emit(&record);
        record
    }

    /// Write the record to the log
    pub fn emit(&self, record: &AuditRecord) {
        let metadata = mask_metadata(&record.metadata);
        match record.outcome {
            AuditOutcome::Failure => tracing::warn!(
                audit_id = %record.id,
                action = %record.action,
                resource = %record.resource,
                resource_id = record.resource_id.as_deref().unwrap_or("-"),
                shop = %record.shop,
                outcome = record.outcome.as_str(),
                metadata = %metadata,
                "Audit"
            ),
            _ => tracing::info!(
                audit_id = %record.id,
                action = %record.action,
                resource = %record.resource,
                resource_id = record.resource_id.as_deref().unwrap_or("-"),
                shop = %record.shop,
                outcome = record.outcome.as_str(),
                metadata = %metadata,
                "Audit"
            ),
        }
    }
}

/// Mask an email, keeping the first two characters of the local part
///
/// `jane.doe@example.com` becomes `ja***@example.com`.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let head: String = local.chars().take(2).collect();
            format!("{head}***@{domain}")
        }
        None => "***".to_string(),
    }
}

/// Mask an identifier, keeping the last four characters
///
/// `123456789` becomes `****6789`.
pub fn mask_id(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

/// Fingerprint under which a redacted shop's final audit record is kept
pub fn redacted_shop_id(shop: &ShopDomain) -> String {
    let digest = hex::encode(Sha256::digest(shop.as_str().as_bytes()));
    format!("redacted-{}", &digest[..12])
}

const EMAIL_KEYS: &[&str] = &["email", "customer_email", "purchaser_email"];
const ID_KEYS: &[&str] = &["customer_id", "purchaser_id"];

/// Copy of `metadata` with PII-bearing fields masked
pub fn mask_metadata(metadata: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match metadata {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let masked = match value {
                        Value::String(s) if EMAIL_KEYS.contains(&key.as_str()) => {
                            Value::String(mask_email(s))
                        }
                        Value::String(s) if ID_KEYS.contains(&key.as_str()) => {
                            Value::String(mask_id(s))
                        }
                        Value::Number(n) if ID_KEYS.contains(&key.as_str()) => {
                            Value::String(mask_id(&n.to_string()))
                        }
                        other => mask_metadata(other),
                    };
                    (key.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_metadata).collect()),
        other => other.clone(),
    }
}
