//! Durable job queue
//!
//! Jobs live in the `image_jobs` table, so several service processes sharing
//! one database file also share one queue. Claims are a single atomic
//! `UPDATE ... RETURNING` and carry a lease that the running worker renews;
//! only jobs whose lease lapsed are recovered.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use loom_common::{Error, Result};
use sqlx::SqlitePool;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{ImageJob, JobStatus, RetentionPolicy, RetryPolicy};
use crate::db::jobs as job_db;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job unless the node already has one pending; returns the pending job
    async fn enqueue(&self, job: &ImageJob) -> Result<ImageJob>;

    async fn get(&self, job_id: Uuid) -> Result<Option<ImageJob>>;

    /// Queued or active job for a node, if any
    async fn find_pending_for_node(&self, node_id: Uuid) -> Result<Option<ImageJob>>;

    /// Atomically take the next runnable job, marking it active under a fresh lease
    async fn claim_next(&self) -> Result<Option<ImageJob>>;

    /// Extend the lease on a job this worker is running; false once the job is no longer active
    async fn renew_lease(&self, job_id: Uuid) -> Result<bool>;

    /// How long a claim holds without renewal
    fn lease_duration(&self) -> Duration;

    async fn mark_completed(&self, job_id: Uuid, image_url: &str) -> Result<()>;

    /// Record a failed attempt; returns the job's resulting status
    ///
    /// A retryable failure with attempts left goes back to `queued` after the
    /// backoff delay, anything else becomes `failed`.
    async fn mark_attempt_failed(&self, job: &ImageJob, reason: &str, retryable: bool) -> Result<JobStatus>;

    /// Delete finished jobs past retention
    async fn prune(&self) -> Result<u64>;

    /// Return active jobs whose lease lapsed to the queue
    async fn recover_interrupted(&self) -> Result<u64>;

    /// Signalled whenever new work becomes available
    fn notifier(&self) -> Arc<Notify>;
}

/// Claim lease used unless configured otherwise
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

pub struct SqliteJobQueue {
    pool: SqlitePool,
    notify: Arc<Notify>,
    retry: RetryPolicy,
    retention: RetentionPolicy,
    lease: Duration,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool, retry: RetryPolicy, retention: RetentionPolicy) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
            retry,
            retention,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease.max(Duration::from_millis(1));
        self
    }
}

fn chrono_duration(d: std::time::Duration) -> Result<ChronoDuration> {
    ChronoDuration::from_std(d).map_err(|e| Error::Internal(format!("duration out of range: {}", e)))
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: &ImageJob) -> Result<ImageJob> {
        if job_db::insert_job(&self.pool, job).await? {
            self.notify.notify_one();
            tracing::info!(job_id = %job.job_id, node_id = %job.node_id, "Image job queued");
            return Ok(job.clone());
        }

        // Lost a race with another submission for the same node
        job_db::find_pending_for_node(&self.pool, job.node_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("pending job for node {} vanished", job.node_id)))
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<ImageJob>> {
        job_db::load_job(&self.pool, job_id).await
    }

    async fn find_pending_for_node(&self, node_id: Uuid) -> Result<Option<ImageJob>> {
        job_db::find_pending_for_node(&self.pool, node_id).await
    }

    async fn claim_next(&self) -> Result<Option<ImageJob>> {
        let now = loom_common::time::now();
        job_db::claim_next(&self.pool, now, now + chrono_duration(self.lease)?).await
    }

    async fn renew_lease(&self, job_id: Uuid) -> Result<bool> {
        let until = loom_common::time::now() + chrono_duration(self.lease)?;
        job_db::renew_lease(&self.pool, job_id, until).await
    }

    fn lease_duration(&self) -> Duration {
        self.lease
    }

    async fn mark_completed(&self, job_id: Uuid, image_url: &str) -> Result<()> {
        job_db::mark_completed(&self.pool, job_id, image_url, loom_common::time::now()).await
    }

    async fn mark_attempt_failed(&self, job: &ImageJob, reason: &str, retryable: bool) -> Result<JobStatus> {
        let now = loom_common::time::now();
        if retryable && job.has_attempts_left() {
            let delay = self.retry.delay_after(job.attempts);
            let run_after = now + chrono_duration(delay)?;
            job_db::reschedule(&self.pool, job.job_id, reason, run_after, now).await?;
            tracing::warn!(
                job_id = %job.job_id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                reason = %reason,
                "Image job attempt failed, retry scheduled"
            );
            Ok(JobStatus::Queued)
        } else {
            job_db::mark_failed(&self.pool, job.job_id, reason, now).await?;
            tracing::info!(
                job_id = %job.job_id,
                attempts = job.attempts,
                reason = %reason,
                "Image job failed"
            );
            Ok(JobStatus::Failed)
        }
    }

    async fn prune(&self) -> Result<u64> {
        let now = loom_common::time::now();
        let completed_before = now - chrono_duration(self.retention.completed)?;
        let failed_before = now - chrono_duration(self.retention.failed)?;
        job_db::prune(&self.pool, completed_before, failed_before).await
    }

    async fn recover_interrupted(&self) -> Result<u64> {
        let count = job_db::requeue_interrupted(&self.pool, loom_common::time::now()).await?;
        if count > 0 {
            tracing::warn!(count, "Requeued image jobs whose worker lease lapsed");
            self.notify.notify_one();
        }
        Ok(count)
    }

    fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::SubmitRequest;
    use loom_common::db::{init_database, init_memory_database};

    fn retention() -> RetentionPolicy {
        RetentionPolicy {
            completed: Duration::from_secs(3600),
            failed: Duration::from_secs(7 * 24 * 3600),
        }
    }

    async fn queue() -> SqliteJobQueue {
        let pool = init_memory_database().await.unwrap();
        SqliteJobQueue::new(pool, RetryPolicy::new(Duration::from_millis(0)), retention())
    }

    /// Two queues on separate pools over one database file, like two service processes
    async fn shared_queues(dir: &tempfile::TempDir, lease: Duration) -> (SqliteJobQueue, SqliteJobQueue) {
        let path = dir.path().join("loom.db");
        let policy = RetryPolicy::new(Duration::from_millis(0));
        let a = SqliteJobQueue::new(init_database(&path).await.unwrap(), policy, retention()).with_lease(lease);
        let b = SqliteJobQueue::new(init_database(&path).await.unwrap(), policy, retention()).with_lease(lease);
        (a, b)
    }

    fn job() -> ImageJob {
        job_with_attempts(3)
    }

    fn job_with_attempts(max_attempts: u32) -> ImageJob {
        ImageJob::new(
            &SubmitRequest {
                node_id: Uuid::new_v4(),
                timeline_id: Uuid::new_v4(),
                prompt: "lanterns on the water".to_string(),
                user_id: "u1".to_string(),
            },
            max_attempts,
        )
    }

    #[tokio::test]
    async fn test_retry_until_attempts_exhausted() {
        let queue = queue().await;
        let job = job();
        queue.enqueue(&job).await.unwrap();

        for attempt in 1..=3 {
            let claimed = queue.claim_next().await.unwrap().expect("job should be claimable");
            assert_eq!(claimed.attempts, attempt);
            let status = queue.mark_attempt_failed(&claimed, "provider timeout", true).await.unwrap();
            let expected = if attempt < 3 { JobStatus::Queued } else { JobStatus::Failed };
            assert_eq!(status, expected);
        }

        let stored = queue.get(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("provider timeout"));
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_attempt_limit_overrides_queue_policy() {
        // Job stored while the configured limit was 2
        let queue = queue().await;
        let job = job_with_attempts(2);
        queue.enqueue(&job).await.unwrap();

        let first = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(queue.mark_attempt_failed(&first, "timeout", true).await.unwrap(), JobStatus::Queued);
        let second = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(queue.mark_attempt_failed(&second, "timeout", true).await.unwrap(), JobStatus::Failed);
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_returns_existing_pending_job() {
        let queue = queue().await;
        let first = job();
        let mut duplicate = job();
        duplicate.node_id = first.node_id;

        assert_eq!(queue.enqueue(&first).await.unwrap().job_id, first.job_id);
        assert_eq!(queue.enqueue(&duplicate).await.unwrap().job_id, first.job_id);
        assert!(queue.get(duplicate.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let queue = queue().await;
        queue.enqueue(&job()).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();
        let status = queue.mark_attempt_failed(&claimed, "write failed", false).await.unwrap();
        assert_eq!(status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_pending_lookup_ignores_finished_jobs() {
        let queue = queue().await;
        let job = job();
        queue.enqueue(&job).await.unwrap();
        assert_eq!(
            queue.find_pending_for_node(job.node_id).await.unwrap().map(|j| j.job_id),
            Some(job.job_id)
        );

        let claimed = queue.claim_next().await.unwrap().unwrap();
        queue.mark_completed(claimed.job_id, "/media/t/n.png").await.unwrap();
        assert!(queue.find_pending_for_node(job.node_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_claim_is_not_recovered_by_another_process() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = shared_queues(&dir, DEFAULT_LEASE).await;
        a.enqueue(&job()).await.unwrap();
        let claimed = a.claim_next().await.unwrap().unwrap();
        assert!(claimed.lease_expires_at.is_some());

        // Process B starting up must leave A's running job alone
        assert_eq!(b.recover_interrupted().await.unwrap(), 0);
        assert!(b.claim_next().await.unwrap().is_none());
        let stored = b.get(claimed.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Active);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_lapsed_claim_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = shared_queues(&dir, Duration::from_millis(20)).await;
        a.enqueue(&job()).await.unwrap();
        let claimed = a.claim_next().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(b.recover_interrupted().await.unwrap(), 1);
        let reclaimed = b.claim_next().await.unwrap().unwrap();
        assert_eq!(reclaimed.job_id, claimed.job_id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn test_renewal_keeps_claim_alive() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = shared_queues(&dir, Duration::from_millis(200)).await;
        a.enqueue(&job()).await.unwrap();
        let claimed = a.claim_next().await.unwrap().unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(80)).await;
            assert!(a.renew_lease(claimed.job_id).await.unwrap());
        }
        assert_eq!(b.recover_interrupted().await.unwrap(), 0);

        a.mark_completed(claimed.job_id, "/media/x.png").await.unwrap();
        assert!(!a.renew_lease(claimed.job_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_jobs() {
        let queue = queue().await;
        queue.enqueue(&job()).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();
        queue.mark_completed(claimed.job_id, "/media/x.png").await.unwrap();

        assert_eq!(queue.prune().await.unwrap(), 0);
        assert!(queue.get(claimed.job_id).await.unwrap().is_some());
    }
}
