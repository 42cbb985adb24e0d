//! The intake pipeline
//!
//! ```text
//! raw body + headers
//!       |
//!       v
//! [verify signature] ---invalid---> 401, nothing written
//!       |
//!       v
//! [resolve topic + shop, parse body] ---bad---> 400
//!       |
//!       v
//! [idempotency lookup, then audit trail] ---seen---> 200 duplicate
//!       |
//!       v
//! [rate limit] ---over budget---> 429
//!       |
//!       v
//! [atomic claim] ---lost race---> 200 duplicate
//!       |
//!       v
//! [executor] ---> 200 (processed, skipped, retry scheduled)
//! ```
//!
//! Everything from the claim on runs in its own task. A request dropped
//! mid-flight (client gone, shutdown) does not leave a claimed key that was
//! never executed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, field, info, instrument, warn, Instrument, Span};

use crate::audit::AuditOutcome;
use crate::config::{WishcraftConfig, DEFAULT_IDEMPOTENCY_TTL};
use crate::error::{WebhookError, WebhookResult};
use crate::model::ShopDomain;
use crate::security::{InMemoryWindowCounter, RateLimitResult, RateLimiter};
use crate::store::Store;
use crate::webhooks::events::{Event, EventPayload};
use crate::webhooks::executor::{ExecutionOutcome, Executor};
use crate::webhooks::idempotency::{
    ClaimResult, IdempotencyKey, IdempotencyStore, InMemoryIdempotencyStore,
};
use crate::webhooks::signature::{
    SignatureVerifier, HEADER_HMAC, HEADER_SHOP_DOMAIN, HEADER_TOPIC, HEADER_TRIGGERED_AT,
    HEADER_WEBHOOK_ID,
};
use crate::webhooks::topic::Topic;

/// An inbound delivery before any checks
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    /// Raw request body, exactly as signed
    pub body: Bytes,
    /// Topic header (or query fallback)
    pub topic: Option<String>,
    /// Shop domain header
    pub shop: Option<String>,
    /// Base64 HMAC header
    pub signature: Option<String>,
    /// Provider delivery id
    pub webhook_id: Option<String>,
    /// Provider emit time (RFC 3339)
    pub triggered_at: Option<String>,
}

impl WebhookRequest {
    /// Collect the delivery headers.
    ///
    /// The topic header wins over `query_topic`.
    pub fn from_parts(headers: &HeaderMap, query_topic: Option<String>, body: Bytes) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Self {
            body,
            topic: header(HEADER_TOPIC).or(query_topic),
            shop: header(HEADER_SHOP_DOMAIN),
            signature: header(HEADER_HMAC),
            webhook_id: header(HEADER_WEBHOOK_ID),
            triggered_at: header(HEADER_TRIGGERED_AT),
        }
    }
}

/// How an accepted delivery ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// Handler committed
    Processed,
    /// Handler ran and had nothing to do
    Skipped,
    /// Seen before; not executed again
    Duplicate,
    /// Handler failed; an internal retry owns the effect
    RetryScheduled,
    /// Handler failed and will not be retried
    Failed,
}

/// Body of a 200 response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    /// Outcome
    pub status: AckStatus,
    /// Resolved topic
    pub topic: Topic,
}

impl Ack {
    fn new(status: AckStatus, topic: Topic) -> Self {
        Self { status, topic }
    }

    fn from_outcome(topic: Topic, outcome: &ExecutionOutcome) -> Self {
        let status = match outcome {
            ExecutionOutcome::Applied(report) if report.outcome == AuditOutcome::Skipped => {
                AckStatus::Skipped
            }
            ExecutionOutcome::Applied(_) => AckStatus::Processed,
            ExecutionOutcome::RetryScheduled { .. } => AckStatus::RetryScheduled,
            ExecutionOutcome::Failed { .. } => AckStatus::Failed,
        };
        Self::new(status, topic)
    }
}

/// Delivery counters since start
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    processed: AtomicU64,
    skipped: AtomicU64,
    duplicates: AtomicU64,
    retries_scheduled: AtomicU64,
    failed: AtomicU64,
    rejected_signature: AtomicU64,
    rejected_invalid: AtomicU64,
    rate_limited: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineCounters {
    /// Deliveries received
    pub received: u64,
    /// Handler committed
    pub processed: u64,
    /// Handler had nothing to do
    pub skipped: u64,
    /// Acknowledged as duplicates
    pub duplicates: u64,
    /// Handler failed, retry queued
    pub retries_scheduled: u64,
    /// Handler failed, not retried
    pub failed: u64,
    /// Rejected with 401
    pub rejected_signature: u64,
    /// Rejected with 400
    pub rejected_invalid: u64,
    /// Rejected with 429
    pub rate_limited: u64,
}

impl PipelineStats {
    fn record(&self, result: &WebhookResult<Ack>) {
        let counter = match result {
            Ok(ack) => match ack.status {
                AckStatus::Processed => &self.processed,
                AckStatus::Skipped => &self.skipped,
                AckStatus::Duplicate => &self.duplicates,
                AckStatus::RetryScheduled => &self.retries_scheduled,
                AckStatus::Failed => &self.failed,
            },
            Err(WebhookError::Authentication(_)) => &self.rejected_signature,
            Err(WebhookError::RateLimited { .. }) => &self.rate_limited,
            Err(_) => &self.rejected_invalid,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values
    pub fn snapshot(&self) -> PipelineCounters {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineCounters {
            received: load(&self.received),
            processed: load(&self.processed),
            skipped: load(&self.skipped),
            duplicates: load(&self.duplicates),
            retries_scheduled: load(&self.retries_scheduled),
            failed: load(&self.failed),
            rejected_signature: load(&self.rejected_signature),
            rejected_invalid: load(&self.rejected_invalid),
            rate_limited: load(&self.rate_limited),
        }
    }
}

/// Signature check, routing, guard and execution for one delivery
pub struct WebhookPipeline<S: Store> {
    verifier: SignatureVerifier,
    idempotency: Arc<dyn IdempotencyStore>,
    limiter: RateLimiter,
    executor: Arc<Executor<S>>,
    retention: Duration,
    stats: PipelineStats,
}

impl<S: Store> WebhookPipeline<S> {
    /// Assemble a pipeline from its stages
    pub fn new(
        verifier: SignatureVerifier,
        idempotency: Arc<dyn IdempotencyStore>,
        limiter: RateLimiter,
        executor: Executor<S>,
    ) -> Self {
        Self {
            verifier,
            idempotency,
            limiter,
            executor: Arc::new(executor),
            retention: DEFAULT_IDEMPOTENCY_TTL,
            stats: PipelineStats::default(),
        }
    }

    /// How far back the audit trail is searched for a delivery
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Build a pipeline with in-process guard state
    pub fn from_config(config: &WishcraftConfig, store: Arc<S>) -> Self {
        let mut verifier = SignatureVerifier::new(&config.webhook_secret);
        if let Some(previous) = &config.previous_webhook_secret {
            verifier = verifier.with_previous_secret(previous);
        }

        Self::new(
            verifier,
            Arc::new(InMemoryIdempotencyStore::new(
                config.idempotency_ttl,
                config.idempotency_capacity,
            )),
            RateLimiter::from_config(config, Arc::new(InMemoryWindowCounter::new())),
            Executor::from_config(store, config),
        )
        .with_retention(config.idempotency_ttl)
    }

    /// The executor
    pub fn executor(&self) -> &Executor<S> {
        &self.executor
    }

    /// The rate limiter
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The idempotency store
    pub fn idempotency(&self) -> &Arc<dyn IdempotencyStore> {
        &self.idempotency
    }

    /// Delivery counters
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Run one delivery through every stage.
    ///
    /// `Err` carries the rejection reported to the event source; everything
    /// after admission is acknowledged with `Ok`.
    #[instrument(skip_all, fields(topic = field::Empty, shop = field::Empty))]
    pub async fn handle(&self, request: WebhookRequest) -> WebhookResult<Ack> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let result = self.admit_and_execute(request).await;
        self.stats.record(&result);

        let outcome = match &result {
            Ok(ack) => match ack.status {
                AckStatus::Processed => "processed",
                AckStatus::Skipped => "skipped",
                AckStatus::Duplicate => "duplicate",
                AckStatus::RetryScheduled => "retry_scheduled",
                AckStatus::Failed => "failed",
            },
            Err(err) => err.code(),
        };
        metrics::counter!("wishcraft_webhooks_total", "outcome" => outcome).increment(1);

        result
    }

    async fn admit_and_execute(&self, request: WebhookRequest) -> WebhookResult<Ack> {
        if !self
            .verifier
            .verify(&request.body, request.signature.as_deref())
            .is_valid()
        {
            let reason = if request.signature.is_none() {
                "missing signature header"
            } else {
                "signature mismatch"
            };
            warn!(reason, "Rejected delivery");
            return Err(WebhookError::Authentication(reason.to_string()));
        }

        let raw_topic = request
            .topic
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| WebhookError::validation("missing topic"))?;
        let topic = Topic::parse(raw_topic)
            .ok_or_else(|| WebhookError::UnknownTopic(raw_topic.to_string()))?;
        Span::current().record("topic", topic.as_str());

        let shop = request
            .shop
            .as_deref()
            .and_then(ShopDomain::parse)
            .ok_or_else(|| WebhookError::validation("missing or invalid shop domain header"))?;
        Span::current().record("shop", shop.as_str());

        let payload: serde_json::Value = serde_json::from_slice(&request.body)
            .map_err(|e| WebhookError::validation(format!("malformed JSON: {e}")))?;
        let typed = EventPayload::from_value(topic, &payload)?;
        if let Some(declared) = typed.declared_shop() {
            if ShopDomain::parse(declared).as_ref() != Some(&shop) {
                return Err(WebhookError::validation(
                    "payload shop domain does not match header",
                ));
            }
        }

        let key = IdempotencyKey::derive(&shop, topic, request.webhook_id.as_deref(), &request.body);

        // Duplicates never consume rate-limit budget
        if let Some(state) = self.idempotency.lookup(&key).await {
            debug!(key = %key, ?state, "Duplicate delivery");
            return Ok(Ack::new(AckStatus::Duplicate, topic));
        }
        if self.seen_in_audit_trail(&key).await? {
            debug!(key = %key, "Duplicate delivery found in audit trail");
            if self.idempotency.check_and_record(&key).await == ClaimResult::New {
                self.idempotency.mark_completed(&key).await;
            }
            return Ok(Ack::new(AckStatus::Duplicate, topic));
        }

        if let RateLimitResult::Exceeded { retry_after, limit } =
            self.limiter.check(&shop, topic).await
        {
            warn!(limit, retry_after_secs = retry_after.as_secs(), "Rate limited");
            return Err(WebhookError::RateLimited {
                shop: shop.to_string(),
                topic: topic.to_string(),
                retry_after,
            });
        }

        if let ClaimResult::Duplicate(state) = self.idempotency.check_and_record(&key).await {
            debug!(key = %key, ?state, "Lost claim to a concurrent delivery");
            return Ok(Ack::new(AckStatus::Duplicate, topic));
        }

        let event = Event {
            topic,
            shop,
            webhook_id: request.webhook_id,
            payload,
            received_at: Utc::now(),
            triggered_at: request.triggered_at.as_deref().and_then(parse_timestamp),
            signature_valid: true,
        };

        let outcome = self.execute_claimed(key, event).await?;
        let ack = Ack::from_outcome(topic, &outcome);
        info!(status = ?ack.status, "Delivery acknowledged");
        Ok(ack)
    }

    async fn seen_in_audit_trail(&self, key: &IdempotencyKey) -> WebhookResult<bool> {
        let since = Utc::now() - chrono::Duration::from_std(self.retention).unwrap_or_default();
        let seen = self
            .executor
            .store()
            .idempotency_key_seen(key.shop(), &key.to_string(), since)
            .await?;
        Ok(seen)
    }

    /// Execute a claimed delivery and settle its key.
    ///
    /// The work runs on a spawned task, so it completes even if the caller
    /// stops waiting for it.
    async fn execute_claimed(
        &self,
        key: IdempotencyKey,
        event: Event,
    ) -> WebhookResult<ExecutionOutcome> {
        let executor = Arc::clone(&self.executor);
        let idempotency = Arc::clone(&self.idempotency);
        let claimed = key.clone();

        let task = tokio::spawn(
            async move {
                let outcome = executor.execute(&event, &key.to_string()).await;
                match &outcome {
                    ExecutionOutcome::Applied(_) => idempotency.mark_completed(&key).await,
                    ExecutionOutcome::RetryScheduled { error, .. }
                    | ExecutionOutcome::Failed { error } => {
                        idempotency.mark_failed(&key, error).await
                    }
                }
                outcome
            }
            .instrument(Span::current()),
        );

        match task.await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // A run that did commit is still found in the audit trail
                error!(key = %claimed, error = %e, "Handler task aborted");
                self.idempotency.release(&claimed).await;
                Err(WebhookError::Internal(format!("handler task aborted: {e}")))
            }
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
