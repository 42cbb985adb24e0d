//! Duplicate-delivery suppression
//!
//! Every delivery is keyed by shop, topic and a fingerprint: the provider's
//! webhook id when it sends one, otherwise the SHA-256 of the raw body. A key
//! is claimed atomically before the handler runs and remembered for the
//! retention window, so a re-delivery is acknowledged without running the
//! handler again.
//!
//! This cache is bounded and lives in process memory. It answers the common
//! case cheaply; the audit trail in the store is the durable record.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::ShopDomain;
use crate::webhooks::topic::Topic;

/// Identity of one logical delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    shop: ShopDomain,
    topic: Topic,
    fingerprint: String,
}

impl IdempotencyKey {
    /// Derive the key for a delivery
    pub fn derive(shop: &ShopDomain, topic: Topic, webhook_id: Option<&str>, body: &[u8]) -> Self {
        let fingerprint = match webhook_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => format!("sha256:{}", hex::encode(Sha256::digest(body))),
        };
        Self {
            shop: shop.clone(),
            topic,
            fingerprint,
        }
    }

    /// Shop part
    pub fn shop(&self) -> &ShopDomain {
        &self.shop
    }

    /// Topic part
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Fingerprint part
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.shop, self.topic, self.fingerprint)
    }
}

/// What is known about a claimed delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    /// Claimed, handler running
    Processing,
    /// Handler committed
    Completed,
    /// Handler failed; a retry job owns the effect
    Failed {
        /// Error summary
        error: String,
    },
}

/// Result of an atomic claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// First sighting; the caller owns execution
    New,
    /// Already seen within the retention window
    Duplicate(DeliveryState),
}

/// Delivery state storage
#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    /// State of a key, if claimed and not expired
    async fn lookup(&self, key: &IdempotencyKey) -> Option<DeliveryState>;

    /// Claim a key. Exactly one concurrent caller sees [`ClaimResult::New`].
    async fn check_and_record(&self, key: &IdempotencyKey) -> ClaimResult;

    /// Record that the handler committed
    async fn mark_completed(&self, key: &IdempotencyKey);

    /// Record that the handler failed
    async fn mark_failed(&self, key: &IdempotencyKey, error: &str);

    /// Forget a claim whose execution never finished
    async fn release(&self, key: &IdempotencyKey);

    /// Drop expired keys, returning how many were removed
    async fn purge_expired(&self) -> usize;

    /// Number of live keys
    async fn key_count(&self) -> usize;
}

#[derive(Debug, Clone)]
struct Entry {
    state: DeliveryState,
    recorded_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
}

/// In-process store with a retention window and a size bound.
///
/// When full, the oldest key is evicted first.
#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl InMemoryIdempotencyStore {
    /// Create a store
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn is_live(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.recorded_at) < self.ttl
    }

    fn set_state(&self, key: &IdempotencyKey, state: DeliveryState) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&key.to_string()) {
            entry.state = state;
        }
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn lookup(&self, key: &IdempotencyKey) -> Option<DeliveryState> {
        let inner = self.inner.lock();
        let now = Instant::now();
        inner
            .entries
            .get(&key.to_string())
            .filter(|entry| self.is_live(entry, now))
            .map(|entry| entry.state.clone())
    }

    async fn check_and_record(&self, key: &IdempotencyKey) -> ClaimResult {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let rendered = key.to_string();

        if let Some(entry) = inner.entries.get(&rendered) {
            if self.is_live(entry, now) {
                return ClaimResult::Duplicate(entry.state.clone());
            }
        }

        // An expired entry for the same key is replaced; drop its stale slot
        if inner.entries.remove(&rendered).is_some() {
            inner.order.retain(|k| k != &rendered);
        }

        while inner.entries.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }

        inner.order.push_back(rendered.clone());
        inner.entries.insert(
            rendered,
            Entry {
                state: DeliveryState::Processing,
                recorded_at: now,
            },
        );
        ClaimResult::New
    }

    async fn mark_completed(&self, key: &IdempotencyKey) {
        self.set_state(key, DeliveryState::Completed);
    }

    async fn mark_failed(&self, key: &IdempotencyKey, error: &str) {
        self.set_state(
            key,
            DeliveryState::Failed {
                error: error.to_string(),
            },
        );
    }

    async fn release(&self, key: &IdempotencyKey) {
        let mut inner = self.inner.lock();
        let rendered = key.to_string();
        if inner.entries.remove(&rendered).is_some() {
            inner.order.retain(|k| k != &rendered);
        }
    }

    async fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let before = inner.entries.len();

        let Inner { entries, order } = &mut *inner;
        entries.retain(|_, entry| now.duration_since(entry.recorded_at) < self.ttl);
        order.retain(|k| entries.contains_key(k));

        before - inner.entries.len()
    }

    async fn key_count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
