//! Delivery rate limiting and operator authentication
//!
//! - Fixed-window rate limiting keyed by shop and topic
//! - Bearer-token authentication for the operator endpoints
//!
//! # Rate limiting
//!
//! ```text
//! (shop, topic) -> WindowCounter::increment -> count <= limit ? Allowed : Exceeded
//! ```
//!
//! Window counts live behind the [`WindowCounter`] trait. The limiter owns a
//! handle to a counter store that is injected at construction, never a
//! process-wide map, so several workers can share one backing store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::WishcraftConfig;
use crate::model::ShopDomain;
use crate::webhooks::topic::Topic;

// =============================================================================
// Window counters
// =============================================================================

/// Count observed in the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Hits in the current window, including this one
    pub count: u32,
    /// Time until the window resets
    pub resets_in: Duration,
}

/// Shared fixed-window counter store
#[async_trait]
pub trait WindowCounter: Send + Sync + 'static {
    /// Record one hit for `key` and return the window's count
    async fn increment(&self, key: &str, window: Duration) -> WindowCount;

    /// Drop windows that ended more than one window ago
    async fn cleanup(&self, window: Duration);

    /// Number of live keys
    async fn key_count(&self) -> usize;
}

#[derive(Debug, Clone)]
struct RateBucket {
    count: u32,
    window_start: Instant,
}

/// In-process counter store
#[derive(Debug, Default)]
pub struct InMemoryWindowCounter {
    buckets: RwLock<HashMap<String, RateBucket>>,
}

impl InMemoryWindowCounter {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WindowCounter for InMemoryWindowCounter {
    async fn increment(&self, key: &str, window: Duration) -> WindowCount {
        let mut buckets = self.buckets.write().await;
        let now = Instant::now();

        let bucket = buckets.entry(key.to_string()).or_insert_with(|| RateBucket {
            count: 0,
            window_start: now,
        });

        if now.duration_since(bucket.window_start) >= window {
            bucket.count = 0;
            bucket.window_start = now;
        }

        bucket.count = bucket.count.saturating_add(1);

        WindowCount {
            count: bucket.count,
            resets_in: window.saturating_sub(now.duration_since(bucket.window_start)),
        }
    }

    async fn cleanup(&self, window: Duration) {
        let mut buckets = self.buckets.write().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| now.duration_since(bucket.window_start) < window * 2);
    }

    async fn key_count(&self) -> usize {
        self.buckets.read().await.len()
    }
}

// =============================================================================
// Rate Limiter
// =============================================================================

/// Per shop+topic fixed-window rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    default_limit: u32,
    topic_limits: HashMap<Topic, u32>,
    window: Duration,
    counter: Arc<dyn WindowCounter>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("default_limit", &self.default_limit)
            .field("topic_limits", &self.topic_limits)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter with one budget for every topic
    pub fn new(default_limit: u32, window: Duration, counter: Arc<dyn WindowCounter>) -> Self {
        Self {
            default_limit,
            topic_limits: HashMap::new(),
            window,
            counter,
        }
    }

    /// Create a limiter from service configuration
    pub fn from_config(config: &WishcraftConfig, counter: Arc<dyn WindowCounter>) -> Self {
        Self {
            default_limit: config.default_rate_limit,
            topic_limits: config.topic_rate_limits.clone(),
            window: config.rate_limit_window,
            counter,
        }
    }

    /// Override the budget for one topic
    pub fn with_topic_limit(mut self, topic: Topic, limit: u32) -> Self {
        self.topic_limits.insert(topic, limit);
        self
    }

    /// Budget for a topic
    pub fn limit_for(&self, topic: Topic) -> u32 {
        self.topic_limits
            .get(&topic)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Record a delivery and decide whether it is within budget
    pub async fn check(&self, shop: &ShopDomain, topic: Topic) -> RateLimitResult {
        let limit = self.limit_for(topic);
        let key = format!("{shop}:{topic}");
        let observed = self.counter.increment(&key, self.window).await;

        if observed.count > limit {
            debug!(shop = %shop, topic = %topic, count = observed.count, limit, "Rate limit exceeded");
            RateLimitResult::Exceeded {
                retry_after: observed.resets_in,
                limit,
            }
        } else {
            RateLimitResult::Allowed {
                remaining: limit - observed.count,
                limit,
            }
        }
    }

    /// Clean up expired windows (call periodically)
    pub async fn cleanup(&self) {
        self.counter.cleanup(self.window).await;
    }

    /// Number of tracked shop+topic windows
    pub async fn tracked_keys(&self) -> usize {
        self.counter.key_count().await
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request is allowed
    Allowed {
        /// Remaining requests in window
        remaining: u32,
        /// Total limit
        limit: u32,
    },
    /// Rate limit exceeded
    Exceeded {
        /// Time until rate limit resets
        retry_after: Duration,
        /// Total limit
        limit: u32,
    },
}

impl RateLimitResult {
    /// Check if the request is allowed
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

// =============================================================================
// Operator authentication
// =============================================================================

/// Authentication result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    /// Authentication successful
    Authenticated,
    /// Missing Authorization header
    MissingHeader,
    /// Invalid Authorization header format
    InvalidFormat,
    /// Invalid token
    InvalidToken,
}

impl AuthResult {
    /// Check if the request is authorized
    pub fn is_authorized(&self) -> bool {
        matches!(self, AuthResult::Authenticated)
    }

    /// Error message for unauthorized results
    pub fn error_message(&self) -> Option<&'static str> {
        match self {
            AuthResult::Authenticated => None,
            AuthResult::MissingHeader => Some("Missing Authorization header"),
            AuthResult::InvalidFormat => {
                Some("Invalid Authorization format. Expected: Bearer <token>")
            }
            AuthResult::InvalidToken => Some("Invalid token"),
        }
    }
}

/// Bearer-token authenticator for operator endpoints
#[derive(Clone)]
pub struct TokenAuthenticator {
    token_hash: [u8; 32],
}

impl std::fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenAuthenticator(<redacted>)")
    }
}

impl TokenAuthenticator {
    /// Create an authenticator for one token; only its hash is kept
    pub fn new(token: &str) -> Self {
        Self {
            token_hash: hash_token(token),
        }
    }

    /// Authenticate a request based on the Authorization header
    ///
    /// Expected format: `Authorization: Bearer <token>`
    pub fn authenticate(&self, auth_header: Option<&str>) -> AuthResult {
        let Some(header) = auth_header else {
            return AuthResult::MissingHeader;
        };

        let token = match header.strip_prefix("Bearer ") {
            Some(t) => t.trim(),
            None => return AuthResult::InvalidFormat,
        };

        if token.is_empty() {
            return AuthResult::InvalidFormat;
        }

        if constant_time_compare(&self.token_hash, &hash_token(token)) {
            AuthResult::Authenticated
        } else {
            warn!("Invalid operator token attempt");
            AuthResult::InvalidToken
        }
    }
}

fn hash_token(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Constant-time byte comparison
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shop(domain: &str) -> ShopDomain {
        ShopDomain::parse(domain).unwrap()
    }

    fn limiter(limit: u32) -> RateLimiter {
        RateLimiter::new(
            limit,
            Duration::from_secs(60),
            Arc::new(InMemoryWindowCounter::new()),
        )
    }

    #[tokio::test]
    async fn test_rate_limiter() {
        let limiter = limiter(3);
        let s = shop("a.myshopify.com");

        assert!(limiter.check(&s, Topic::ProductsUpdate).await.is_allowed());
        assert!(limiter.check(&s, Topic::ProductsUpdate).await.is_allowed());
        assert_eq!(
            limiter.check(&s, Topic::ProductsUpdate).await,
            RateLimitResult::Allowed {
                remaining: 0,
                limit: 3
            }
        );

        assert!(!limiter.check(&s, Topic::ProductsUpdate).await.is_allowed());
    }

    #[tokio::test]
    async fn test_keys_are_shop_and_topic() {
        let limiter = limiter(1);
        let a = shop("a.myshopify.com");
        let b = shop("b.myshopify.com");

        assert!(limiter.check(&a, Topic::OrdersCreate).await.is_allowed());
        assert!(!limiter.check(&a, Topic::OrdersCreate).await.is_allowed());

        // Same shop, different topic
        assert!(limiter.check(&a, Topic::ProductsUpdate).await.is_allowed());
        // Different shop, same topic
        assert!(limiter.check(&b, Topic::OrdersCreate).await.is_allowed());

        assert_eq!(limiter.tracked_keys().await, 3);
    }

    #[tokio::test]
    async fn test_topic_override() {
        let limiter = limiter(60).with_topic_limit(Topic::OrdersCreate, 30);
        let s = shop("a.myshopify.com");

        for _ in 0..30 {
            assert!(limiter.check(&s, Topic::OrdersCreate).await.is_allowed());
        }
        match limiter.check(&s, Topic::OrdersCreate).await {
            RateLimitResult::Exceeded { retry_after, limit } => {
                assert_eq!(limit, 30);
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shared_counter_across_limiters() {
        let counter: Arc<dyn WindowCounter> = Arc::new(InMemoryWindowCounter::new());
        let one = RateLimiter::new(2, Duration::from_secs(60), counter.clone());
        let two = RateLimiter::new(2, Duration::from_secs(60), counter);
        let s = shop("a.myshopify.com");

        assert!(one.check(&s, Topic::ProductsUpdate).await.is_allowed());
        assert!(two.check(&s, Topic::ProductsUpdate).await.is_allowed());
        assert!(!one.check(&s, Topic::ProductsUpdate).await.is_allowed());
    }

    #[tokio::test]
    async fn test_window_resets() {
        let limiter = RateLimiter::new(
            1,
            Duration::from_millis(20),
            Arc::new(InMemoryWindowCounter::new()),
        );
        let s = shop("a.myshopify.com");

        assert!(limiter.check(&s, Topic::ProductsUpdate).await.is_allowed());
        assert!(!limiter.check(&s, Topic::ProductsUpdate).await.is_allowed());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.check(&s, Topic::ProductsUpdate).await.is_allowed());

        tokio::time::sleep(Duration::from_millis(50)).await;
        limiter.cleanup().await;
        assert_eq!(limiter.tracked_keys().await, 0);
    }

    #[test]
    fn test_token_authenticator() {
        let auth = TokenAuthenticator::new("operator-token");

        assert_eq!(
            auth.authenticate(Some("Bearer operator-token")),
            AuthResult::Authenticated
        );
        assert_eq!(
            auth.authenticate(Some("Bearer wrong-token")),
            AuthResult::InvalidToken
        );
        assert_eq!(auth.authenticate(None), AuthResult::MissingHeader);
        assert_eq!(
            auth.authenticate(Some("Basic dXNlcjpwYXNz")),
            AuthResult::InvalidFormat
        );
        assert_eq!(auth.authenticate(Some("Bearer   ")), AuthResult::InvalidFormat);
        assert!(!format!("{auth:?}").contains("operator-token"));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"hello", b"hello"));
        assert!(!constant_time_compare(b"hello", b"world"));
        assert!(!constant_time_compare(b"hello", b"hell"));
        assert!(constant_time_compare(b"", b""));
    }
}
