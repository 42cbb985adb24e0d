//! In-memory [`Store`]
//!
//! Transactions are serialized through one async mutex. Each transaction
//! works on a staged copy of the tables which replaces the committed copy
//! only when the closure returns `Ok`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::{ShopTx, Store, Tables};
use crate::audit::{redacted_shop_id, AuditRecord};
use crate::error::{StoreError, StoreResult};
use crate::jobs::{JobRecord, JobStatus, JOB_LEASE};
use crate::model::ShopDomain;

/// Reference store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store behind an `Arc`
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn transaction<T, E, F>(&self, shop: &ShopDomain, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&mut ShopTx<'t>) -> Result<T, E> + Send,
        T: Send,
        E: From<StoreError> + Send,
    {
        let mut committed = self.tables.lock().await;
        let mut staged = committed.clone();

        let value = {
            let mut tx = ShopTx::new(shop.clone(), &mut staged);
            f(&mut tx)
        };

        match value {
            Ok(value) => {
                *committed = staged;
                Ok(value)
            }
            Err(e) => {
                debug!(shop = %shop, "Transaction rolled back");
                Err(e)
            }
        }
    }

    async fn claim_due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<JobRecord>> {
        let mut tables = self.tables.lock().await;

        let mut due: Vec<&mut JobRecord> = tables
            .jobs
            .values_mut()
            .filter(|job| job.is_claimable(now, JOB_LEASE))
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.run_at.cmp(&b.run_at))
        });

        Ok(due
            .into_iter()
            .take(limit)
            .map(|job| {
                job.status = JobStatus::Running;
                job.attempts = job.attempts.saturating_add(1);
                job.updated_at = now;
                job.clone()
            })
            .collect())
    }

    async fn save_job(&self, job: &JobRecord) -> StoreResult<JobStatus> {
        let mut tables = self.tables.lock().await;
        let existing = tables
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job.id)))?;

        let cancelled = existing.status == JobStatus::Cancelled;
        *existing = job.clone();
        if cancelled && job.status == JobStatus::Pending {
            existing.status = JobStatus::Cancelled;
        }
        Ok(existing.status)
    }

    async fn idempotency_key_seen(
        &self,
        shop: &ShopDomain,
        key: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let tables = self.tables.lock().await;
        let redacted = redacted_shop_id(shop);
        Ok(tables.audit.iter().rev().any(|record| {
            (record.shop == shop.as_str() || record.shop == redacted)
                && record.idempotency_key.as_deref() == Some(key)
                && record.timestamp >= since
        }))
    }

    async fn list_jobs(
        &self,
        shop: Option<&ShopDomain>,
        status: Option<JobStatus>,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>> {
        let tables = self.tables.lock().await;
        let mut jobs: Vec<JobRecord> = tables
            .jobs
            .values()
            .filter(|job| shop.map_or(true, |s| &job.shop == s))
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn list_audit(&self, shop: Option<&str>, limit: usize) -> StoreResult<Vec<AuditRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .audit
            .iter()
            .rev()
            .filter(|record| shop.map_or(true, |s| record.shop == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLogger, AuditOutcome};
    use crate::jobs::{JobKind, JobTransition, RetryPolicy};
    use crate::store::fixtures::*;
    use crate::webhooks::topic::Topic;
    use serde_json::json;

    fn retry_job(shop: &ShopDomain, priority: i32, now: DateTime<Utc>) -> JobRecord {
        JobRecord::new(
            shop.clone(),
            JobKind::WebhookRetry {
                topic: Topic::ProductsUpdate,
            },
            json!({}),
            RetryPolicy::standard(),
            now,
        )
        .with_priority(priority)
    }

    #[tokio::test]
    async fn test_commit_on_ok() {
        let store = MemoryStore::new();
        let s = shop("a.myshopify.com");

        store
            .transaction(&s, |tx| tx.insert_registry(registry(&s, "reg", 1)))
            .await
            .unwrap();

        let found = store
            .transaction(&s, |tx| Ok::<_, StoreError>(tx.registry("reg").is_some()))
            .await
            .unwrap();
        assert!(found);
    }

    #[tokio::test]
    async fn test_rollback_on_err() {
        let store = MemoryStore::new();
        let s = shop("a.myshopify.com");

        let result: StoreResult<()> = store
            .transaction(&s, |tx| {
                tx.insert_registry(registry(&s, "reg", 1))?;
                Err(StoreError::Unavailable("connection reset".into()))
            })
            .await;
        assert!(result.is_err());

        let rows = store
            .transaction(&s, |tx| Ok::<_, StoreError>(tx.row_count()))
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn test_claim_due_jobs_orders_and_marks_running() {
        let store = MemoryStore::new();
        let s = shop("a.myshopify.com");
        let now = Utc::now();

        let low = retry_job(&s, 0, now);
        let high = retry_job(&s, 10, now);
        let later = retry_job(&s, 50, now).delayed(std::time::Duration::from_secs(60));
        let (low_id, high_id) = (low.id, high.id);

        store
            .transaction(&s, |tx| {
                tx.enqueue_job(low)?;
                tx.enqueue_job(high)?;
                tx.enqueue_job(later)?;
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();

        let claimed = store.claim_due_jobs(now, 10).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high_id, low_id]);
        assert!(claimed
            .iter()
            .all(|j| j.status == JobStatus::Running && j.attempts == 1));

        // Running jobs are not claimed twice
        assert!(store.claim_due_jobs(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_claim_is_reclaimed() {
        let store = MemoryStore::new();
        let s = shop("a.myshopify.com");
        let now = Utc::now();
        let job = retry_job(&s, 0, now);
        store
            .transaction(&s, |tx| tx.enqueue_job(job).map(|_| ()))
            .await
            .unwrap();

        assert_eq!(store.claim_due_jobs(now, 10).await.unwrap().len(), 1);
        assert!(store.claim_due_jobs(now, 10).await.unwrap().is_empty());

        let later = now + chrono::Duration::from_std(JOB_LEASE).unwrap();
        let reclaimed = store.claim_due_jobs(later, 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_job_cancelled_while_running_is_not_rescheduled() {
        let store = MemoryStore::new();
        let s = shop("a.myshopify.com");
        let now = Utc::now();
        let job = retry_job(&s, 0, now);
        store
            .transaction(&s, |tx| tx.enqueue_job(job).map(|_| ()))
            .await
            .unwrap();

        let mut running = store.claim_due_jobs(now, 1).await.unwrap().remove(0);
        let cancelled = store
            .transaction(&s, |tx| Ok::<_, StoreError>(tx.cancel_open_jobs(now)))
            .await
            .unwrap();
        assert_eq!(cancelled, 1);

        running.apply(
            &JobTransition::Retry {
                run_at: now,
                error: "connection reset".into(),
            },
            now,
        );
        assert_eq!(store.save_job(&running).await.unwrap(), JobStatus::Cancelled);

        let stored = store.list_jobs(Some(&s), None, 10).await.unwrap();
        assert_eq!(stored[0].status, JobStatus::Cancelled);
        assert_eq!(stored[0].last_error.as_deref(), Some("connection reset"));
        let later = now + chrono::Duration::from_std(JOB_LEASE).unwrap();
        assert!(store.claim_due_jobs(later, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idempotency_key_seen_within_window() {
        let store = MemoryStore::new();
        let s = shop("a.myshopify.com");
        let now = Utc::now();
        let record = AuditLogger::new().record(
            &s,
            Topic::ProductsUpdate,
            "product",
            None,
            AuditOutcome::Skipped,
            Some("a.myshopify.com:products/update:wh-1"),
            json!({}),
            now,
        );
        store
            .transaction(&s, |tx| {
                tx.append_audit(record);
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();

        let key = "a.myshopify.com:products/update:wh-1";
        let hour = chrono::Duration::hours(1);
        assert!(store.idempotency_key_seen(&s, key, now - hour).await.unwrap());
        assert!(!store.idempotency_key_seen(&s, key, now + hour).await.unwrap());
        assert!(!store
            .idempotency_key_seen(&s, "a.myshopify.com:products/update:wh-2", now - hour)
            .await
            .unwrap());
        let other = shop("b.myshopify.com");
        assert!(!store.idempotency_key_seen(&other, key, now - hour).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_job_requires_existing_row() {
        let store = MemoryStore::new();
        let s = shop("a.myshopify.com");
        let job = retry_job(&s, 0, Utc::now());
        assert!(matches!(
            store.save_job(&job).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_jobs_filters() {
        let store = MemoryStore::new();
        let a = shop("a.myshopify.com");
        let b = shop("b.myshopify.com");
        let now = Utc::now();

        for s in [&a, &b] {
            let job = retry_job(s, 0, now);
            store
                .transaction(s, |tx| tx.enqueue_job(job).map(|_| ()))
                .await
                .unwrap();
        }
        store
            .transaction(&a, |tx| Ok::<_, StoreError>(tx.cancel_open_jobs(now)))
            .await
            .unwrap();

        assert_eq!(store.list_jobs(None, None, 10).await.unwrap().len(), 2);
        assert_eq!(store.list_jobs(Some(&a), None, 10).await.unwrap().len(), 1);
        let pending = store
            .list_jobs(None, Some(JobStatus::Pending), 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].shop, b);
    }
}
