//! Image generation jobs
//!
//! Job lifecycle: `queued → active → completed | failed`, with a failed
//! attempt returning to `queued` until retries are exhausted. Submissions
//! that find an existing image resolve to `already_exists`, and the inline
//! path (no queue backend) resolves to `completed` without creating a job.

pub mod executor;
pub mod media;
pub mod orchestrator;
pub mod queue;
pub mod worker;

pub use executor::{ImageJobExecutor, JobError};
pub use media::MediaStore;
pub use orchestrator::{JobOrchestrator, OrchestratorError};
pub use queue::{JobQueue, SqliteJobQueue};
pub use worker::{spawn_maintenance_task, WorkerConfig, WorkerPool};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Persisted job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "active" => Some(JobStatus::Active),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Immediate outcome of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Queued,
    Completed,
    AlreadyExists,
}

/// One unit of asynchronous image-generation work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageJob {
    pub job_id: Uuid,
    pub node_id: Uuid,
    pub timeline_id: Uuid,
    pub user_id: String,
    pub prompt: String,
    pub status: JobStatus,
    /// Attempts started so far (incremented on claim)
    pub attempts: u32,
    pub max_attempts: u32,
    pub failure_reason: Option<String>,
    pub image_url: Option<String>,
    /// Earliest time a queued job may be claimed
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// While active, the claim is held until this time unless renewed
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl ImageJob {
    pub fn new(request: &SubmitRequest, max_attempts: u32) -> Self {
        let now = loom_common::time::now();
        Self {
            job_id: Uuid::new_v4(),
            node_id: request.node_id,
            timeline_id: request.timeline_id,
            user_id: request.user_id.clone(),
            prompt: request.prompt.clone(),
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts,
            failure_reason: None,
            image_url: None,
            run_after: now,
            created_at: now,
            updated_at: now,
            finished_at: None,
            lease_expires_at: None,
        }
    }

    /// Whether a retryable failure of the latest attempt may be retried
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub node_id: Uuid,
    pub timeline_id: Uuid,
    /// Scene direction from the user; may be empty
    pub prompt: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub status: SubmitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Job status as exposed to pollers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub node_id: Uuid,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub attempts: u32,
}

impl From<&ImageJob> for JobStatusView {
    fn from(job: &ImageJob) -> Self {
        Self {
            job_id: job.job_id,
            node_id: job.node_id,
            status: job.status,
            error: job.failure_reason.clone(),
            image_url: job.image_url.clone(),
            attempts: job.attempts,
        }
    }
}

/// Exponential backoff between attempts
///
/// The attempt limit travels with each job (`ImageJob::max_attempts`), so a
/// config change never reinterprets work already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff_base: Duration,
}

/// Upper bound on a single backoff delay
const MAX_BACKOFF: Duration = Duration::from_secs(300);

impl RetryPolicy {
    pub fn new(backoff_base: Duration) -> Self {
        Self { backoff_base }
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(MAX_BACKOFF)
    }
}

/// How long finished jobs are kept before pruning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed: Duration,
    pub failed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(Duration::from_secs(2));
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(2));
        assert_eq!(policy.delay_after(25), MAX_BACKOFF);
    }

    #[test]
    fn test_attempts_left_uses_job_limit() {
        let mut job = ImageJob::new(
            &SubmitRequest {
                node_id: Uuid::new_v4(),
                timeline_id: Uuid::new_v4(),
                prompt: String::new(),
                user_id: "u1".to_string(),
            },
            2,
        );
        job.attempts = 1;
        assert!(job.has_attempts_left());
        job.attempts = 2;
        assert!(!job.has_attempts_left());

        // Zero counts as a single attempt
        job.max_attempts = 0;
        job.attempts = 1;
        assert!(!job.has_attempts_left());
    }

    #[test]
    fn test_status_roundtrip_strings() {
        for status in [JobStatus::Queued, JobStatus::Active, JobStatus::Completed, JobStatus::Failed] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("cancelled"), None);
    }

    #[test]
    fn test_submit_outcome_omits_absent_fields() {
        let outcome = SubmitOutcome {
            status: SubmitStatus::AlreadyExists,
            job_id: None,
            image_url: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json, serde_json::json!({"status": "already_exists"}));
    }
}
