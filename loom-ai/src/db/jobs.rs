//! Image job persistence
//!
//! The `image_jobs` table is the queue shared by every process pointed at the
//! same database. State writes go through `retry_on_lock` because request
//! handlers and workers write concurrently.

use chrono::{DateTime, Utc};
use loom_common::time::{parse_db_timestamp, to_db_timestamp};
use loom_common::{Error, Result};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use super::parse_uuid;
use crate::jobs::{ImageJob, JobStatus};
use crate::utils::{db_retry::DEFAULT_MAX_LOCK_WAIT_MS, retry_on_lock};

const JOB_COLUMNS: &str = "job_id, node_id, timeline_id, user_id, prompt, status, attempts, \
    max_attempts, failure_reason, image_url, run_after, created_at, updated_at, finished_at, lease_expires_at";

fn job_from_row(row: &SqliteRow) -> Result<ImageJob> {
    let job_id: String = row.get("job_id");
    let node_id: String = row.get("node_id");
    let timeline_id: String = row.get("timeline_id");
    let status: String = row.get("status");
    let run_after: String = row.get("run_after");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let finished_at: Option<String> = row.get("finished_at");
    let lease_expires_at: Option<String> = row.get("lease_expires_at");

    Ok(ImageJob {
        job_id: parse_uuid(&job_id, "job_id")?,
        node_id: parse_uuid(&node_id, "node_id")?,
        timeline_id: parse_uuid(&timeline_id, "timeline_id")?,
        user_id: row.get("user_id"),
        prompt: row.get("prompt"),
        status: JobStatus::parse(&status)
            .ok_or_else(|| Error::Internal(format!("Unknown job status '{}'", status)))?,
        attempts: row.get::<i64, _>("attempts").max(0) as u32,
        max_attempts: row.get::<i64, _>("max_attempts").max(0) as u32,
        failure_reason: row.get("failure_reason"),
        image_url: row.get("image_url"),
        run_after: parse_db_timestamp(&run_after)?,
        created_at: parse_db_timestamp(&created_at)?,
        updated_at: parse_db_timestamp(&updated_at)?,
        finished_at: finished_at.as_deref().map(parse_db_timestamp).transpose()?,
        lease_expires_at: lease_expires_at.as_deref().map(parse_db_timestamp).transpose()?,
    })
}

/// Insert a new job; false when the node already has a pending job
pub async fn insert_job(pool: &SqlitePool, job: &ImageJob) -> Result<bool> {
    let job_id = job.job_id.to_string();
    let node_id = job.node_id.to_string();
    let timeline_id = job.timeline_id.to_string();
    let run_after = to_db_timestamp(job.run_after);
    let created_at = to_db_timestamp(job.created_at);
    let updated_at = to_db_timestamp(job.updated_at);

    retry_on_lock("insert_job", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            INSERT INTO image_jobs (
                job_id, node_id, timeline_id, user_id, prompt, status, attempts,
                max_attempts, failure_reason, image_url, run_after, created_at, updated_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?, ?, NULL)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&job_id)
        .bind(&node_id)
        .bind(&timeline_id)
        .bind(&job.user_id)
        .bind(&job.prompt)
        .bind(job.status.as_str())
        .bind(job.attempts as i64)
        .bind(job.max_attempts as i64)
        .bind(&run_after)
        .bind(&created_at)
        .bind(&updated_at)
        .execute(pool)
        .await
        .map_err(Error::Database)?;
        Ok::<bool, Error>(result.rows_affected() == 1)
    })
    .await
}

pub async fn load_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<ImageJob>> {
    let row = sqlx::query(&format!("SELECT {} FROM image_jobs WHERE job_id = ?", JOB_COLUMNS))
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await
        .map_err(Error::Database)?;

    row.as_ref().map(job_from_row).transpose()
}

/// Most recent queued or active job for a node
pub async fn find_pending_for_node(pool: &SqlitePool, node_id: Uuid) -> Result<Option<ImageJob>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM image_jobs \
         WHERE node_id = ? AND status IN ('queued', 'active') \
         ORDER BY created_at DESC LIMIT 1",
        JOB_COLUMNS
    ))
    .bind(node_id.to_string())
    .fetch_optional(pool)
    .await
    .map_err(Error::Database)?;

    row.as_ref().map(job_from_row).transpose()
}

/// Atomically move the oldest claimable job to `active`, counting the attempt
///
/// The claim holds until `lease_until`; see [`renew_lease`].
pub async fn claim_next(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    lease_until: DateTime<Utc>,
) -> Result<Option<ImageJob>> {
    let now = to_db_timestamp(now);
    let lease_until = to_db_timestamp(lease_until);

    retry_on_lock("claim_next_job", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let row = sqlx::query(&format!(
            r#"
            UPDATE image_jobs
            SET status = 'active', attempts = attempts + 1, lease_expires_at = ?, updated_at = ?
            WHERE job_id = (
                SELECT job_id FROM image_jobs
                WHERE status = 'queued' AND run_after <= ?
                ORDER BY run_after ASC, created_at ASC
                LIMIT 1
            )
            AND status = 'queued'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(&lease_until)
        .bind(&now)
        .bind(&now)
        .fetch_optional(pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(job_from_row).transpose()
    })
    .await
}

/// Extend the claim on an active job; false when the job is no longer active
pub async fn renew_lease(pool: &SqlitePool, job_id: Uuid, until: DateTime<Utc>) -> Result<bool> {
    let job_id = job_id.to_string();
    let until = to_db_timestamp(until);

    retry_on_lock("renew_job_lease", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            "UPDATE image_jobs SET lease_expires_at = ? WHERE job_id = ? AND status = 'active'",
        )
        .bind(&until)
        .bind(&job_id)
        .execute(pool)
        .await
        .map_err(Error::Database)?;
        Ok::<bool, Error>(result.rows_affected() == 1)
    })
    .await
}

pub async fn mark_completed(
    pool: &SqlitePool,
    job_id: Uuid,
    image_url: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let job_id = job_id.to_string();
    let now = to_db_timestamp(now);

    retry_on_lock("mark_job_completed", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            UPDATE image_jobs
            SET status = 'completed', image_url = ?, failure_reason = NULL,
                lease_expires_at = NULL, updated_at = ?, finished_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(image_url)
        .bind(&now)
        .bind(&now)
        .bind(&job_id)
        .execute(pool)
        .await
        .map_err(Error::Database)?;
        Ok::<(), Error>(())
    })
    .await
}

/// Return a job to the queue after a failed attempt
pub async fn reschedule(
    pool: &SqlitePool,
    job_id: Uuid,
    reason: &str,
    run_after: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    let job_id = job_id.to_string();
    let run_after = to_db_timestamp(run_after);
    let now = to_db_timestamp(now);

    retry_on_lock("reschedule_job", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            UPDATE image_jobs
            SET status = 'queued', failure_reason = ?, run_after = ?,
                lease_expires_at = NULL, updated_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(reason)
        .bind(&run_after)
        .bind(&now)
        .bind(&job_id)
        .execute(pool)
        .await
        .map_err(Error::Database)?;
        Ok::<(), Error>(())
    })
    .await
}

pub async fn mark_failed(
    pool: &SqlitePool,
    job_id: Uuid,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let job_id = job_id.to_string();
    let now = to_db_timestamp(now);

    retry_on_lock("mark_job_failed", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            UPDATE image_jobs
            SET status = 'failed', failure_reason = ?, lease_expires_at = NULL,
                updated_at = ?, finished_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(reason)
        .bind(&now)
        .bind(&now)
        .bind(&job_id)
        .execute(pool)
        .await
        .map_err(Error::Database)?;
        Ok::<(), Error>(())
    })
    .await
}

/// Delete finished jobs past their retention window, returning the count removed
pub async fn prune(
    pool: &SqlitePool,
    completed_before: DateTime<Utc>,
    failed_before: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM image_jobs
        WHERE (status = 'completed' AND finished_at < ?)
           OR (status = 'failed' AND finished_at < ?)
        "#,
    )
    .bind(to_db_timestamp(completed_before))
    .bind(to_db_timestamp(failed_before))
    .execute(pool)
    .await
    .map_err(Error::Database)?;

    Ok(result.rows_affected())
}

/// Put jobs whose claim lapsed (worker crashed or lost its database) back in the queue
///
/// Active jobs with a live lease belong to a running worker, possibly in
/// another process, and are left alone.
pub async fn requeue_interrupted(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64> {
    let now = to_db_timestamp(now);

    retry_on_lock("requeue_interrupted_jobs", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            UPDATE image_jobs
            SET status = 'queued', run_after = ?, lease_expires_at = NULL, updated_at = ?
            WHERE status = 'active'
              AND (lease_expires_at IS NULL OR lease_expires_at < ?)
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await
        .map_err(Error::Database)?;
        Ok::<u64, Error>(result.rows_affected())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::SubmitRequest;
    use loom_common::db::init_memory_database;

    fn lease() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::minutes(5)
    }

    fn job() -> ImageJob {
        ImageJob::new(
            &SubmitRequest {
                node_id: Uuid::new_v4(),
                timeline_id: Uuid::new_v4(),
                prompt: "a quiet harbor".to_string(),
                user_id: "user-1".to_string(),
            },
            3,
        )
    }

    #[tokio::test]
    async fn test_claim_moves_to_active_and_counts_attempt() {
        let pool = init_memory_database().await.unwrap();
        let job = job();
        insert_job(&pool, &job).await.unwrap();

        let claimed = claim_next(&pool, Utc::now(), lease()).await.unwrap().unwrap();
        assert_eq!(claimed.job_id, job.job_id);
        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(claimed.attempts, 1);

        // Nothing left to claim
        assert!(claim_next(&pool, Utc::now(), lease()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rescheduled_job_waits_for_run_after() {
        let pool = init_memory_database().await.unwrap();
        let job = job();
        insert_job(&pool, &job).await.unwrap();
        let claimed = claim_next(&pool, Utc::now(), lease()).await.unwrap().unwrap();

        let now = Utc::now();
        reschedule(&pool, claimed.job_id, "provider timeout", now + chrono::Duration::seconds(30), now)
            .await
            .unwrap();

        assert!(claim_next(&pool, now, lease()).await.unwrap().is_none());
        let reclaimed = claim_next(&pool, now + chrono::Duration::seconds(31), lease())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.attempts, 2);
        assert_eq!(reclaimed.failure_reason.as_deref(), Some("provider timeout"));
    }

    #[tokio::test]
    async fn test_pending_lookup_ignores_terminal_jobs() {
        let pool = init_memory_database().await.unwrap();
        let job = job();
        insert_job(&pool, &job).await.unwrap();
        assert!(find_pending_for_node(&pool, job.node_id).await.unwrap().is_some());

        mark_failed(&pool, job.job_id, "boom", Utc::now()).await.unwrap();
        assert!(find_pending_for_node(&pool, job.node_id).await.unwrap().is_none());

        let loaded = load_job(&pool, job.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_prune_uses_separate_retention() {
        let pool = init_memory_database().await.unwrap();
        let done = job();
        let broken = job();
        insert_job(&pool, &done).await.unwrap();
        insert_job(&pool, &broken).await.unwrap();

        let finished = Utc::now() - chrono::Duration::hours(2);
        mark_completed(&pool, done.job_id, "/media/a.png", finished).await.unwrap();
        mark_failed(&pool, broken.job_id, "boom", finished).await.unwrap();

        let now = Utc::now();
        let removed = prune(&pool, now - chrono::Duration::hours(1), now - chrono::Duration::days(7))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(load_job(&pool, done.job_id).await.unwrap().is_none());
        assert!(load_job(&pool, broken.job_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_requeue_interrupted_waits_for_lease_expiry() {
        let pool = init_memory_database().await.unwrap();
        let job = job();
        insert_job(&pool, &job).await.unwrap();
        let claimed_at = Utc::now();
        let lease_until = claimed_at + chrono::Duration::seconds(60);
        let claimed = claim_next(&pool, claimed_at, lease_until).await.unwrap().unwrap();
        assert_eq!(claimed.lease_expires_at.map(to_db_timestamp), Some(to_db_timestamp(lease_until)));

        // Live claim held by a worker
        assert_eq!(requeue_interrupted(&pool, claimed_at + chrono::Duration::seconds(30)).await.unwrap(), 0);
        assert_eq!(load_job(&pool, job.job_id).await.unwrap().unwrap().status, JobStatus::Active);

        let lapsed = claimed_at + chrono::Duration::seconds(61);
        assert_eq!(requeue_interrupted(&pool, lapsed).await.unwrap(), 1);
        let loaded = load_job(&pool, job.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Queued);
        assert!(loaded.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn test_renewed_lease_survives_recovery() {
        let pool = init_memory_database().await.unwrap();
        let job = job();
        insert_job(&pool, &job).await.unwrap();
        let now = Utc::now();
        claim_next(&pool, now, now + chrono::Duration::seconds(10)).await.unwrap();

        assert!(renew_lease(&pool, job.job_id, now + chrono::Duration::seconds(40)).await.unwrap());
        assert_eq!(requeue_interrupted(&pool, now + chrono::Duration::seconds(20)).await.unwrap(), 0);

        mark_completed(&pool, job.job_id, "/media/a.png", now).await.unwrap();
        assert!(!renew_lease(&pool, job.job_id, now + chrono::Duration::seconds(80)).await.unwrap());
        assert!(load_job(&pool, job.job_id).await.unwrap().unwrap().lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn test_second_pending_job_for_node_is_rejected() {
        let pool = init_memory_database().await.unwrap();
        let first = job();
        let mut second = job();
        second.node_id = first.node_id;

        assert!(insert_job(&pool, &first).await.unwrap());
        assert!(!insert_job(&pool, &second).await.unwrap());

        mark_failed(&pool, first.job_id, "boom", Utc::now()).await.unwrap();
        assert!(insert_job(&pool, &second).await.unwrap());
    }
}
