//! Durable job records and retry policy
//!
//! Jobs are created when a handler defers work (GDPR data export) or when a
//! handler fails and its effect is retried internally. Status moves
//! `pending -> running -> completed | pending (retry) | failed`. When its
//! shop uninstalls an unfinished job is `cancelled`; a cancelled job that was
//! running may still complete or fail, but it is never scheduled again.
//!
//! A claim is a lease: a job left `running` for longer than [`JOB_LEASE`]
//! (its worker crashed or could not save the result) is claimable again.
//!
//! [`next_transition`] is the pure decision function used by the executor
//! after a run: given the job and what happened, it says what comes next.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::ShopDomain;
use crate::webhooks::topic::Topic;

/// How long a claimed job may stay `running` before it is reclaimed
pub const JOB_LEASE: Duration = Duration::from_secs(15 * 60);

/// Unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a job does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Re-run a webhook handler whose first execution failed
    WebhookRetry {
        /// Topic of the original delivery
        topic: Topic,
    },
    /// Assemble a customer's data for a GDPR data request
    CustomerDataExport {
        /// Provider's data-request id, used to deduplicate
        data_request_id: Option<i64>,
        /// Customer whose data is exported
        customer_id: i64,
    },
}

impl JobKind {
    /// Short name for logs and filters
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::WebhookRetry { .. } => "webhook_retry",
            JobKind::CustomerDataExport { .. } => "customer_data_export",
        }
    }
}

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `run_at`
    Pending,
    /// Claimed by the executor
    Running,
    /// Finished successfully
    Completed,
    /// Exhausted its retries
    Failed,
    /// Cancelled (shop uninstalled)
    Cancelled,
}

impl JobStatus {
    /// Terminal states never run again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Parse the snake_case form used in query strings
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" | "canceled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

/// Backoff strategy for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// `base * 2^(attempt-1)`, capped
    Exponential,
}

/// Retry policy attached to each job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total runs allowed, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// How delays grow
    pub strategy: BackoffStrategy,
}

impl RetryPolicy {
    /// Retry-safe webhook effects (inventory sync, product refresh, purchases)
    pub fn standard() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// GDPR effects: more attempts, shorter gaps, still bounded
    pub fn compliance() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(15 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Fixed delay policy
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Delay after the given failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay.min(self.max_delay),
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(31));
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }
}

/// A durable job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique id
    pub id: JobId,
    /// What to run
    pub kind: JobKind,
    /// Tenant scope
    pub shop: ShopDomain,
    /// Input for the run (the original event for retries)
    pub payload: serde_json::Value,
    /// Current status
    pub status: JobStatus,
    /// Higher runs first among due jobs
    pub priority: i32,
    /// Runs started so far
    pub attempts: u32,
    /// Retry policy
    pub retry_policy: RetryPolicy,
    /// Earliest time the job may run
    pub run_at: DateTime<Utc>,
    /// Output of a completed run
    pub result: Option<serde_json::Value>,
    /// Error from the most recent failed run
    pub last_error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a pending job due now
    pub fn new(
        shop: ShopDomain,
        kind: JobKind,
        payload: serde_json::Value,
        retry_policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            kind,
            shop,
            payload,
            status: JobStatus::Pending,
            priority: 0,
            attempts: 0,
            retry_policy,
            run_at: now,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Delay the first run
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.run_at += chrono::Duration::from_std(delay).unwrap_or_default();
        self
    }

    /// Due, or running with an expired lease
    pub fn is_claimable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        match self.status {
            JobStatus::Pending => self.run_at <= now,
            JobStatus::Running => {
                self.updated_at + chrono::Duration::from_std(lease).unwrap_or_default() <= now
            }
            _ => false,
        }
    }

    /// Apply a transition decided by [`next_transition`]
    pub fn apply(&mut self, transition: &JobTransition, now: DateTime<Utc>) {
        match transition {
            JobTransition::Complete { result } => {
                self.status = JobStatus::Completed;
                self.result = Some(result.clone());
                self.last_error = None;
            }
            JobTransition::Retry { run_at, error } => {
                self.status = JobStatus::Pending;
                self.run_at = *run_at;
                self.last_error = Some(error.clone());
            }
            JobTransition::Fail { error } => {
                self.status = JobStatus::Failed;
                self.last_error = Some(error.clone());
            }
        }
        self.updated_at = now;
    }
}

/// What happened when a job ran
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The effect succeeded
    Succeeded(serde_json::Value),
    /// The effect failed
    Failed {
        /// Error summary
        error: String,
        /// Whether another attempt could succeed
        retryable: bool,
    },
}

/// Next state for a job after a run
#[derive(Debug, Clone, PartialEq)]
pub enum JobTransition {
    /// Mark completed with a result
    Complete {
        /// Stored as the job result
        result: serde_json::Value,
    },
    /// Back to pending, due at `run_at`
    Retry {
        /// Next run time
        run_at: DateTime<Utc>,
        /// Error from this run
        error: String,
    },
    /// Terminal failure
    Fail {
        /// Error from this run
        error: String,
    },
}

/// Decide the next state of a job that has just run.
///
/// `job.attempts` must already count the run that produced `outcome`.
pub fn next_transition(job: &JobRecord, outcome: JobOutcome, now: DateTime<Utc>) -> JobTransition {
    match outcome {
        JobOutcome::Succeeded(result) => JobTransition::Complete { result },
        JobOutcome::Failed { error, retryable } => {
            if !retryable || job.attempts >= job.retry_policy.max_attempts {
                return JobTransition::Fail { error };
            }
            let delay = job.retry_policy.delay_for_attempt(job.attempts);
            let run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            JobTransition::Retry { run_at, error }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shop() -> ShopDomain {
        ShopDomain::parse("jobs.myshopify.com").unwrap()
    }

    fn job(policy: RetryPolicy) -> JobRecord {
        JobRecord::new(
            shop(),
            JobKind::WebhookRetry {
                topic: Topic::InventoryLevelsUpdate,
            },
            json!({}),
            policy,
            Utc::now(),
        )
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(40));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(60));
    }

    #[test]
    fn test_fixed_delays() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn test_compliance_policy_is_tighter() {
        let standard = RetryPolicy::standard();
        let compliance = RetryPolicy::compliance();
        assert!(compliance.max_attempts > standard.max_attempts);
        assert!(compliance.delay_for_attempt(1) < standard.delay_for_attempt(1));
    }

    #[test]
    fn test_success_completes() {
        let mut record = job(RetryPolicy::standard());
        record.attempts = 1;
        let t = next_transition(&record, JobOutcome::Succeeded(json!({"ok": true})), Utc::now());
        assert!(matches!(t, JobTransition::Complete { .. }));
    }

    #[test]
    fn test_retryable_failure_schedules_retry() {
        let now = Utc::now();
        let mut record = job(RetryPolicy::fixed(3, Duration::from_secs(30)));
        record.attempts = 1;
        let t = next_transition(
            &record,
            JobOutcome::Failed {
                error: "db down".into(),
                retryable: true,
            },
            now,
        );
        assert_eq!(
            t,
            JobTransition::Retry {
                run_at: now + chrono::Duration::seconds(30),
                error: "db down".into()
            }
        );
    }

    #[test]
    fn test_exhausted_retries_fail() {
        let mut record = job(RetryPolicy::fixed(3, Duration::from_secs(30)));
        record.attempts = 3;
        let t = next_transition(
            &record,
            JobOutcome::Failed {
                error: "still down".into(),
                retryable: true,
            },
            Utc::now(),
        );
        assert!(matches!(t, JobTransition::Fail { .. }));
    }

    #[test]
    fn test_non_retryable_failure_fails_immediately() {
        let mut record = job(RetryPolicy::standard());
        record.attempts = 1;
        let t = next_transition(
            &record,
            JobOutcome::Failed {
                error: "bad payload".into(),
                retryable: false,
            },
            Utc::now(),
        );
        assert!(matches!(t, JobTransition::Fail { .. }));
    }

    #[test]
    fn test_apply_transition() {
        let now = Utc::now();
        let mut record = job(RetryPolicy::standard());
        record.status = JobStatus::Running;
        record.apply(
            &JobTransition::Fail {
                error: "boom".into(),
            },
            now,
        );
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.status.is_terminal());
        assert_eq!(record.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_running_job_is_reclaimed_after_lease() {
        let now = Utc::now();
        let mut record = job(RetryPolicy::standard());
        assert!(record.is_claimable(now, JOB_LEASE));

        record.status = JobStatus::Running;
        record.updated_at = now;
        assert!(!record.is_claimable(now + chrono::Duration::minutes(14), JOB_LEASE));
        assert!(record.is_claimable(now + chrono::Duration::minutes(15), JOB_LEASE));

        record.status = JobStatus::Cancelled;
        assert!(!record.is_claimable(now + chrono::Duration::days(1), JOB_LEASE));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(JobStatus::parse("Pending"), Some(JobStatus::Pending));
        assert_eq!(JobStatus::parse("canceled"), Some(JobStatus::Cancelled));
        assert_eq!(JobStatus::parse("dead"), None);
    }
}
