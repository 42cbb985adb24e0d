//! Handler execution and the durable retry queue
//!
//! The event source only learns whether a delivery was accepted. What happens
//! after that is the executor's job:
//!
//! ```text
//! Event
//!   |
//!   v
//! [transaction: topic handler + success audit] --Ok--> Applied
//!   |
//!   Err
//!   v
//! [classify] --validation--> failure audit, no retry
//!   |
//!   transient / compliance-critical
//!   v
//! [transaction: failure audit + WebhookRetry job] --> RetryScheduled
//! ```
//!
//! Jobs are picked up later by [`Executor::process_due_jobs`], which runs them
//! and moves each through `pending -> running -> completed | failed`,
//! re-queueing with backoff while attempts remain.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::audit::{AuditLogger, AuditOutcome};
use crate::config::WishcraftConfig;
use crate::crypto::GiftMessageCipher;
use crate::error::{StoreError, WebhookError, WebhookResult};
use crate::jobs::{
    next_transition, JobKind, JobOutcome, JobRecord, JobStatus, JobTransition, RetryPolicy,
};
use crate::model::ShopDomain;
use crate::store::Store;
use crate::webhooks::effects::{self, resource_for, EffectContext, ExecutionReport};
use crate::webhooks::events::Event;
use crate::webhooks::topic::Topic;

/// Priority of retry jobs for GDPR topics
pub const COMPLIANCE_RETRY_PRIORITY: i32 = 5;

const MAX_ERROR_CHARS: usize = 500;

/// Result of running a delivery's handler
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The handler committed
    Applied(ExecutionReport),
    /// The handler failed; a retry job was enqueued
    RetryScheduled {
        /// Job that owns the retry
        job_id: crate::jobs::JobId,
        /// Error from the failed run
        error: String,
    },
    /// The handler failed and will not be retried
    Failed {
        /// Error from the failed run
        error: String,
    },
}

impl ExecutionOutcome {
    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Applied(report) => match report.outcome {
                AuditOutcome::Skipped => "skipped",
                _ => "processed",
            },
            ExecutionOutcome::RetryScheduled { .. } => "retry_scheduled",
            ExecutionOutcome::Failed { .. } => "failed",
        }
    }
}

/// Tally of one job-queue pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobRunSummary {
    /// Jobs claimed
    pub claimed: usize,
    /// Jobs that completed
    pub completed: usize,
    /// Jobs re-queued with backoff
    pub retried: usize,
    /// Jobs that failed terminally
    pub failed: usize,
    /// Jobs whose row vanished while running (shop or customer redacted)
    pub dropped: usize,
    /// Jobs cancelled while running, not rescheduled
    pub cancelled: usize,
    /// Jobs whose result could not be saved; reclaimed after the lease
    pub unsaved: usize,
}

/// Runs topic handlers transactionally and drives the job queue
pub struct Executor<S: Store> {
    store: Arc<S>,
    cipher: GiftMessageCipher,
    audit: AuditLogger,
    standard_retry: RetryPolicy,
    compliance_retry: RetryPolicy,
    job_batch_size: usize,
}

impl<S: Store> Executor<S> {
    /// Create an executor
    pub fn new(store: Arc<S>, cipher: GiftMessageCipher) -> Self {
        Self {
            store,
            cipher,
            audit: AuditLogger::new(),
            standard_retry: RetryPolicy::standard(),
            compliance_retry: RetryPolicy::compliance(),
            job_batch_size: 50,
        }
    }

    /// Create an executor from configuration
    pub fn from_config(store: Arc<S>, config: &WishcraftConfig) -> Self {
        Self::new(store, GiftMessageCipher::new(config.gift_message_key))
            .with_retry_policies(config.standard_retry.clone(), config.compliance_retry.clone())
            .with_job_batch_size(config.job_batch_size)
    }

    /// Override retry policies
    pub fn with_retry_policies(mut self, standard: RetryPolicy, compliance: RetryPolicy) -> Self {
        self.standard_retry = standard;
        self.compliance_retry = compliance;
        self
    }

    /// Override how many jobs one pass claims
    pub fn with_job_batch_size(mut self, size: usize) -> Self {
        self.job_batch_size = size.max(1);
        self
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run the handler for a claimed delivery.
    ///
    /// Never fails: a handler error is recorded and, when retryable, turned
    /// into a job. The caller acknowledges the delivery either way.
    #[instrument(skip_all, fields(shop = %event.shop, topic = %event.topic))]
    pub async fn execute(&self, event: &Event, idempotency_key: &str) -> ExecutionOutcome {
        let now = Utc::now();
        let outcome = match self.run_effect(event, Some(idempotency_key), None, now).await {
            Ok(report) => {
                debug!(outcome = report.outcome.as_str(), "Handler committed");
                ExecutionOutcome::Applied(report)
            }
            Err(err) => self.handle_failure(event, idempotency_key, err, now).await,
        };

        metrics::counter!(
            "wishcraft_webhooks_executed_total",
            "topic" => event.topic.as_str(),
            "outcome" => outcome.label()
        )
        .increment(1);
        outcome
    }

    /// Handler and success audit record in one transaction
    async fn run_effect(
        &self,
        event: &Event,
        idempotency_key: Option<&str>,
        job: Option<&JobRecord>,
        now: DateTime<Utc>,
    ) -> WebhookResult<ExecutionReport> {
        let payload = event.typed_payload()?;
        let ctx = EffectContext {
            event,
            cipher: &self.cipher,
            compliance_retry: &self.compliance_retry,
            now,
        };
        let audit = self.audit;
        let topic = event.topic;
        let retry = job.map(|j| json!({"job_id": j.id.to_string(), "attempt": j.attempts}));

        self.store
            .transaction(&event.shop, move |tx| -> WebhookResult<ExecutionReport> {
                let mut report = effects::apply(tx, &ctx, &payload)?;
                if let (Some(retry), Some(map)) = (retry, report.metadata.as_object_mut()) {
                    map.insert("retry".to_string(), retry);
                }

                let record = audit.record(
                    tx.shop(),
                    topic,
                    report.resource,
                    report.resource_id.clone(),
                    report.outcome,
                    idempotency_key,
                    report.metadata.clone(),
                    now,
                );
                // After a shop redaction only the fingerprinted record remains
                if topic == Topic::ShopRedact {
                    tx.append_redacted_audit(record);
                } else {
                    tx.append_audit(record);
                }
                Ok(report)
            })
            .await
    }

    async fn handle_failure(
        &self,
        event: &Event,
        idempotency_key: &str,
        err: WebhookError,
        now: DateTime<Utc>,
    ) -> ExecutionOutcome {
        let topic = event.topic;
        let message = truncate(&err.to_string());
        let compliance = topic.is_compliance_critical();

        let classified = match err {
            WebhookError::Validation(_)
            | WebhookError::UnknownTopic(_)
            | WebhookError::Authentication(_) => err,
            _ if compliance => WebhookError::ComplianceCritical(message.clone()),
            _ => WebhookError::Transient(message.clone()),
        };

        if compliance {
            error!(error = %classified, "Compliance handler failed");
        } else {
            warn!(error = %classified, "Handler failed");
        }
        metrics::counter!(
            "wishcraft_handler_failures_total",
            "topic" => topic.as_str(),
            "class" => classified.code()
        )
        .increment(1);

        let job = if classified.is_retryable() {
            self.retry_job(event, &message, compliance, now)
        } else {
            None
        };
        let job_id = job.as_ref().map(|j| j.id);
        let scheduled = job.as_ref().is_some_and(|j| j.status == JobStatus::Pending);

        let record = self.audit.record(
            &event.shop,
            topic,
            resource_for(topic),
            None,
            AuditOutcome::Failure,
            Some(idempotency_key),
            json!({
                "error": message,
                "error_class": classified.code(),
                "retry_job_id": job_id.map(|id| id.to_string()),
                "retry_at": job.as_ref().filter(|_| scheduled).map(|j| j.run_at.to_rfc3339()),
            }),
            now,
        );

        let persisted = self
            .store
            .transaction(&event.shop, move |tx| {
                tx.append_audit(record);
                if let Some(job) = job {
                    tx.enqueue_job(job)?;
                }
                Ok::<_, StoreError>(())
            })
            .await;

        match (persisted, job_id) {
            (Ok(()), Some(job_id)) if scheduled => {
                info!(%job_id, "Retry scheduled");
                ExecutionOutcome::RetryScheduled {
                    job_id,
                    error: message,
                }
            }
            (Ok(()), _) => ExecutionOutcome::Failed { error: message },
            (Err(store_err), _) => {
                error!(error = %store_err, "Could not record handler failure");
                ExecutionOutcome::Failed { error: message }
            }
        }
    }

    /// Build the retry job for a failed delivery.
    ///
    /// The delivery counts as the first attempt, so the job starts with one
    /// attempt used and its first run is already backed off.
    fn retry_job(
        &self,
        event: &Event,
        error: &str,
        compliance: bool,
        now: DateTime<Utc>,
    ) -> Option<JobRecord> {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Could not serialize event for retry");
                return None;
            }
        };
        let (policy, priority) = if compliance {
            (self.compliance_retry.clone(), COMPLIANCE_RETRY_PRIORITY)
        } else {
            (self.standard_retry.clone(), 0)
        };

        let mut job = JobRecord::new(
            event.shop.clone(),
            JobKind::WebhookRetry { topic: event.topic },
            payload,
            policy,
            now,
        )
        .with_priority(priority);
        job.attempts = 1;

        let transition = next_transition(
            &job,
            JobOutcome::Failed {
                error: error.to_string(),
                retryable: true,
            },
            now,
        );
        job.apply(&transition, now);
        Some(job)
    }

    /// Claim and run due jobs once.
    ///
    /// A job whose result cannot be saved stays `running` until its lease
    /// expires and is then claimed again; the rest of the batch still runs.
    #[instrument(skip(self))]
    pub async fn process_due_jobs(&self, now: DateTime<Utc>) -> WebhookResult<JobRunSummary> {
        let jobs = self.store.claim_due_jobs(now, self.job_batch_size).await?;
        let mut summary = JobRunSummary {
            claimed: jobs.len(),
            ..Default::default()
        };

        for mut job in jobs {
            let outcome = self.run_job(&job, now).await;
            let transition = next_transition(&job, outcome, now);
            metrics::counter!("wishcraft_jobs_finished_total", "kind" => job.kind.name()).increment(1);
            job.apply(&transition, now);

            let stored = match self.store.save_job(&job).await {
                Ok(stored) => stored,
                Err(StoreError::NotFound(_)) => {
                    debug!(job_id = %job.id, "Job removed while running");
                    summary.dropped += 1;
                    continue;
                }
                Err(e) => {
                    error!(job_id = %job.id, kind = job.kind.name(), error = %e, "Could not save job result");
                    summary.unsaved += 1;
                    continue;
                }
            };

            let (kind, attempts) = (job.kind.name(), job.attempts);
            match (stored, &transition) {
                (JobStatus::Completed, _) => {
                    info!(job_id = %job.id, kind, attempts, "Job completed");
                    summary.completed += 1;
                }
                (JobStatus::Pending, JobTransition::Retry { run_at, error }) => {
                    warn!(job_id = %job.id, kind, attempts, %run_at, %error, "Job failed; retrying");
                    summary.retried += 1;
                }
                (JobStatus::Cancelled, _) => {
                    info!(job_id = %job.id, kind, attempts, "Job cancelled while running");
                    summary.cancelled += 1;
                }
                _ => {
                    let error = job.last_error.as_deref().unwrap_or_default();
                    error!(job_id = %job.id, kind, attempts, error, "Job failed permanently");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn run_job(&self, job: &JobRecord, now: DateTime<Utc>) -> JobOutcome {
        match &job.kind {
            JobKind::WebhookRetry { topic } => self.rerun_webhook(job, *topic, now).await,
            JobKind::CustomerDataExport {
                data_request_id,
                customer_id,
            } => match self
                .build_export(&job.shop, *customer_id, *data_request_id, now)
                .await
            {
                Ok(export) => JobOutcome::Succeeded(export),
                Err(err) => JobOutcome::Failed {
                    retryable: !matches!(err, WebhookError::Validation(_)),
                    error: truncate(&err.to_string()),
                },
            },
        }
    }

    async fn rerun_webhook(&self, job: &JobRecord, topic: Topic, now: DateTime<Utc>) -> JobOutcome {
        let event: Event = match serde_json::from_value(job.payload.clone()) {
            Ok(event) => event,
            Err(e) => {
                return JobOutcome::Failed {
                    error: format!("unreadable retry payload: {e}"),
                    retryable: false,
                }
            }
        };
        if event.topic != topic || event.shop != job.shop {
            return JobOutcome::Failed {
                error: "retry payload does not match job".to_string(),
                retryable: false,
            };
        }

        match self.run_effect(&event, None, Some(job), now).await {
            Ok(report) => JobOutcome::Succeeded(json!({
                "outcome": report.outcome,
                "resource": report.resource,
                "resource_id": report.resource_id,
            })),
            Err(err) => {
                let error = truncate(&err.to_string());
                let record = self.audit.record(
                    &job.shop,
                    topic,
                    resource_for(topic),
                    None,
                    AuditOutcome::Failure,
                    None,
                    json!({
                        "error": error,
                        "retry": {"job_id": job.id.to_string(), "attempt": job.attempts},
                    }),
                    now,
                );
                if let Err(e) = self
                    .store
                    .transaction(&job.shop, move |tx| {
                        tx.append_audit(record);
                        Ok::<_, StoreError>(())
                    })
                    .await
                {
                    error!(job_id = %job.id, error = %e, "Could not record retry failure");
                }
                JobOutcome::Failed {
                    retryable: !matches!(err, WebhookError::Validation(_)),
                    error,
                }
            }
        }
    }

    /// Assemble everything stored about a customer.
    ///
    /// Gift messages are exported as stored, encrypted; the result row is
    /// persisted and must not hold them in the clear.
    async fn build_export(
        &self,
        shop: &ShopDomain,
        customer_id: i64,
        data_request_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> WebhookResult<serde_json::Value> {
        let audit = self.audit;

        self.store
            .transaction(shop, move |tx| -> WebhookResult<serde_json::Value> {
                let registries: Vec<serde_json::Value> = tx
                    .registries()
                    .filter(|r| r.customer_id == Some(customer_id))
                    .map(|r| {
                        let items: Vec<_> = tx.items().filter(|i| i.registry_id == r.id).collect();
                        json!({"registry": r, "items": items})
                    })
                    .collect();

                let purchases = tx
                    .purchases()
                    .filter(|p| p.purchaser_id == Some(customer_id))
                    .map(serde_json::to_value)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| WebhookError::Internal(e.to_string()))?;

                let record = audit.record(
                    tx.shop(),
                    Topic::CustomersDataRequest,
                    "customer_export",
                    data_request_id.map(|id| id.to_string()),
                    AuditOutcome::Success,
                    None,
                    json!({
                        "customer_id": customer_id.to_string(),
                        "registries": registries.len(),
                        "purchases": purchases.len(),
                    }),
                    now,
                );
                tx.append_audit(record);

                Ok(json!({
                    "customer_id": customer_id,
                    "data_request_id": data_request_id,
                    "generated_at": now.to_rfc3339(),
                    "registries": registries,
                    "purchases": purchases,
                    "gift_messages": "encrypted",
                }))
            })
            .await
    }
}

fn truncate(message: &str) -> String {
    message.chars().take(MAX_ERROR_CHARS).collect()
}
