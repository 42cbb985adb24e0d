//! Service configuration
//!
//! All secrets come from environment variables; nothing sensitive is
//! hardcoded or logged.
//!
//! - `WISHCRAFT_WEBHOOK_SECRET` (required): shared HMAC secret for webhook signatures
//! - `WISHCRAFT_WEBHOOK_SECRET_PREVIOUS` (optional): previous secret during rotation
//! - `WISHCRAFT_GIFT_MESSAGE_KEY` (required): base64-encoded 32-byte AES key
//! - `WISHCRAFT_ADMIN_TOKEN` (required): bearer token for operator endpoints
//! - `WISHCRAFT_IDEMPOTENCY_TTL_SECS` (optional): duplicate-suppression window (default: 86400)
//! - `WISHCRAFT_RATE_LIMIT_PER_MINUTE` (optional): default per shop+topic budget (default: 60)
//! - `WISHCRAFT_RATE_LIMIT_ORDERS_PER_MINUTE` (optional): `orders/create` budget (default: 30)
//! - `WISHCRAFT_JOB_POLL_SECS` (optional): job queue poll interval (default: 30)
//! - `WISHCRAFT_MAX_BODY_BYTES` (optional): request body cap (default: 1 MiB)

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use base64::Engine;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::jobs::RetryPolicy;
use crate::webhooks::topic::Topic;

/// Default retention window for idempotency keys
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default per-window budget for a shop+topic pair
pub const DEFAULT_RATE_LIMIT: u32 = 60;

/// Default budget for `orders/create`
pub const DEFAULT_ORDERS_RATE_LIMIT: u32 = 30;

/// Fixed rate-limit window
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Complete service configuration
#[derive(Clone)]
pub struct WishcraftConfig {
    /// Current webhook signing secret
    pub webhook_secret: String,
    /// Previous signing secret, accepted during key rotation
    pub previous_webhook_secret: Option<String>,
    /// AES-256 key for gift messages
    pub gift_message_key: [u8; 32],
    /// Bearer token for operator endpoints
    pub admin_token: String,
    /// How long a processed delivery suppresses re-delivery
    pub idempotency_ttl: Duration,
    /// Maximum number of idempotency keys held in memory
    pub idempotency_capacity: usize,
    /// Default rate-limit budget per window
    pub default_rate_limit: u32,
    /// Per-topic overrides
    pub topic_rate_limits: HashMap<Topic, u32>,
    /// Rate-limit window length
    pub rate_limit_window: Duration,
    /// Retry policy for retry-safe handler failures
    pub standard_retry: RetryPolicy,
    /// Retry policy for GDPR handler failures and exports
    pub compliance_retry: RetryPolicy,
    /// How often the job queue is polled when serving
    pub job_poll_interval: Duration,
    /// Maximum jobs claimed per poll
    pub job_batch_size: usize,
    /// Request body cap in bytes
    pub max_body_bytes: usize,
}

impl std::fmt::Debug for WishcraftConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WishcraftConfig")
            .field("webhook_secret", &"<redacted>")
            .field(
                "previous_webhook_secret",
                &self.previous_webhook_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("gift_message_key", &"<redacted>")
            .field("admin_token", &"<redacted>")
            .field("idempotency_ttl", &self.idempotency_ttl)
            .field("default_rate_limit", &self.default_rate_limit)
            .field("topic_rate_limits", &self.topic_rate_limits)
            .field("job_poll_interval", &self.job_poll_interval)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish_non_exhaustive()
    }
}

impl WishcraftConfig {
    /// Build a configuration with defaults around the three required secrets.
    pub fn new(
        webhook_secret: impl Into<String>,
        gift_message_key: [u8; 32],
        admin_token: impl Into<String>,
    ) -> Self {
        let mut topic_rate_limits = HashMap::new();
        topic_rate_limits.insert(Topic::OrdersCreate, DEFAULT_ORDERS_RATE_LIMIT);

        Self {
            webhook_secret: webhook_secret.into(),
            previous_webhook_secret: None,
            gift_message_key,
            admin_token: admin_token.into(),
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            idempotency_capacity: 100_000,
            default_rate_limit: DEFAULT_RATE_LIMIT,
            topic_rate_limits,
            rate_limit_window: RATE_LIMIT_WINDOW,
            standard_retry: RetryPolicy::standard(),
            compliance_retry: RetryPolicy::compliance(),
            job_poll_interval: Duration::from_secs(30),
            job_batch_size: 50,
            max_body_bytes: 1024 * 1024,
        }
    }

    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if a required variable is not set and
    /// `ConfigError::Invalid` if a value cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let webhook_secret = required("WISHCRAFT_WEBHOOK_SECRET")?;
        if webhook_secret.len() < 32 {
            warn!("SECURITY WARNING: WISHCRAFT_WEBHOOK_SECRET is less than 32 characters");
        }

        let key_b64 = required("WISHCRAFT_GIFT_MESSAGE_KEY")?;
        let gift_message_key = decode_key(&key_b64)?;

        let admin_token = required("WISHCRAFT_ADMIN_TOKEN")?;

        let mut config = Self::new(webhook_secret, gift_message_key, admin_token);

        config.previous_webhook_secret = env::var("WISHCRAFT_WEBHOOK_SECRET_PREVIOUS")
            .ok()
            .filter(|s| !s.is_empty());

        if let Some(secs) = optional_number::<u64>("WISHCRAFT_IDEMPOTENCY_TTL_SECS")? {
            config.idempotency_ttl = Duration::from_secs(secs);
        }

        if let Some(limit) = optional_number::<u32>("WISHCRAFT_RATE_LIMIT_PER_MINUTE")? {
            if limit == 0 {
                return Err(ConfigError::Invalid {
                    name: "WISHCRAFT_RATE_LIMIT_PER_MINUTE",
                    reason: "rate limit cannot be 0".to_string(),
                });
            }
            config.default_rate_limit = limit;
        }

        if let Some(limit) = optional_number::<u32>("WISHCRAFT_RATE_LIMIT_ORDERS_PER_MINUTE")? {
            if limit == 0 {
                return Err(ConfigError::Invalid {
                    name: "WISHCRAFT_RATE_LIMIT_ORDERS_PER_MINUTE",
                    reason: "rate limit cannot be 0".to_string(),
                });
            }
            config.topic_rate_limits.insert(Topic::OrdersCreate, limit);
        }

        if let Some(secs) = optional_number::<u64>("WISHCRAFT_JOB_POLL_SECS")? {
            config.job_poll_interval = Duration::from_secs(secs.max(1));
        }

        if let Some(bytes) = optional_number::<usize>("WISHCRAFT_MAX_BODY_BYTES")? {
            config.max_body_bytes = bytes;
        }

        info!(
            idempotency_ttl_secs = config.idempotency_ttl.as_secs(),
            default_rate_limit = config.default_rate_limit,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Rate-limit budget for a topic
    pub fn rate_limit_for(&self, topic: Topic) -> u32 {
        self.topic_rate_limits
            .get(&topic)
            .copied()
            .unwrap_or(self.default_rate_limit)
    }

    /// Override the rate limit for one topic
    pub fn with_topic_rate_limit(mut self, topic: Topic, limit: u32) -> Self {
        self.topic_rate_limits.insert(topic, limit);
        self
    }

    /// Set the idempotency retention window
    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    /// Accept a previous signing secret during rotation
    pub fn with_previous_secret(mut self, secret: impl Into<String>) -> Self {
        self.previous_webhook_secret = Some(secret.into());
        self
    }

    /// Replace both retry policies
    pub fn with_retry_policies(mut self, standard: RetryPolicy, compliance: RetryPolicy) -> Self {
        self.standard_retry = standard;
        self.compliance_retry = compliance;
        self
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    let value = env::var(name).map_err(|_| ConfigError::Missing(name))?;
    if value.is_empty() {
        return Err(ConfigError::Invalid {
            name,
            reason: "cannot be empty".to_string(),
        });
    }
    Ok(value)
}

fn optional_number<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Decode a base64 AES-256 key
pub fn decode_key(encoded: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| ConfigError::Invalid {
            name: "WISHCRAFT_GIFT_MESSAGE_KEY",
            reason: e.to_string(),
        })?;

    bytes.try_into().map_err(|b: Vec<u8>| ConfigError::Invalid {
        name: "WISHCRAFT_GIFT_MESSAGE_KEY",
        reason: format!("expected 32 bytes, got {}", b.len()),
    })
}

#[cfg(test)]
impl WishcraftConfig {
    /// Configuration for unit tests
    pub fn test_config() -> Self {
        Self::new("test-webhook-secret", [7u8; 32], "test-admin-token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WishcraftConfig::test_config();
        assert_eq!(config.rate_limit_for(Topic::OrdersCreate), 30);
        assert_eq!(config.rate_limit_for(Topic::InventoryLevelsUpdate), 60);
        assert_eq!(config.idempotency_ttl, DEFAULT_IDEMPOTENCY_TTL);
    }

    #[test]
    fn test_topic_override() {
        let config =
            WishcraftConfig::test_config().with_topic_rate_limit(Topic::ProductsUpdate, 5);
        assert_eq!(config.rate_limit_for(Topic::ProductsUpdate), 5);
    }

    #[test]
    fn test_decode_key() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([1u8; 32]);
        assert_eq!(decode_key(&encoded).unwrap(), [1u8; 32]);

        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(decode_key(&short).is_err());
        assert!(decode_key("not base64!").is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = WishcraftConfig::test_config();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("test-webhook-secret"));
        assert!(!debug.contains("test-admin-token"));
        assert!(debug.contains("<redacted>"));
    }
}
