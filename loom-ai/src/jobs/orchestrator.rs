//! Job orchestrator
//!
//! Front door for scene image generation. With a queue configured,
//! submissions become durable jobs and return immediately; without one the
//! work runs inline in the request, guarded per node.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use loom_common::Error;
use thiserror::Error as ThisError;
use uuid::Uuid;

use super::{
    ImageJob, ImageJobExecutor, JobError, JobQueue, JobStatus, JobStatusView, SubmitOutcome, SubmitRequest,
    SubmitStatus,
};
use crate::prompts::MAX_IMAGE_PROMPT_CHARS;
use crate::store::GraphStore;

#[derive(Debug, ThisError)]
pub enum OrchestratorError {
    #[error("Invalid request: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Inline generation already running for the node
    #[error("Generation already in progress for node {0}")]
    InProgress(Uuid),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Data(Error),
}

impl From<Error> for OrchestratorError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(what) => OrchestratorError::NotFound(what),
            Error::InvalidInput(msg) => OrchestratorError::InvalidInput(msg),
            other => OrchestratorError::Data(other),
        }
    }
}

/// Removes a node from the in-flight set when dropped
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    node_id: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.node_id);
        }
    }
}

pub struct JobOrchestrator {
    store: Arc<dyn GraphStore>,
    executor: Arc<ImageJobExecutor>,
    queue: Option<Arc<dyn JobQueue>>,
    max_attempts: u32,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn GraphStore>,
        executor: Arc<ImageJobExecutor>,
        queue: Option<Arc<dyn JobQueue>>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            executor,
            queue,
            max_attempts,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_queued(&self) -> bool {
        self.queue.is_some()
    }

    pub fn queue(&self) -> Option<&Arc<dyn JobQueue>> {
        self.queue.as_ref()
    }

    pub fn executor(&self) -> &Arc<ImageJobExecutor> {
        &self.executor
    }

    /// Submit a scene image request for a node
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, OrchestratorError> {
        if request.prompt.chars().count() > MAX_IMAGE_PROMPT_CHARS {
            return Err(OrchestratorError::InvalidInput(format!(
                "prompt must be at most {} characters",
                MAX_IMAGE_PROMPT_CHARS
            )));
        }

        let node = self
            .store
            .get_node(request.timeline_id, request.node_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "node {} in timeline {}",
                    request.node_id, request.timeline_id
                ))
            })?;

        if let Some(image_url) = node.image_url {
            tracing::debug!(node_id = %request.node_id, "Node already illustrated");
            return Ok(SubmitOutcome {
                status: SubmitStatus::AlreadyExists,
                job_id: None,
                image_url: Some(image_url),
            });
        }

        match &self.queue {
            Some(queue) => self.submit_queued(queue.as_ref(), &request).await,
            None => self.submit_inline(&request).await,
        }
    }

    async fn submit_queued(
        &self,
        queue: &dyn JobQueue,
        request: &SubmitRequest,
    ) -> Result<SubmitOutcome, OrchestratorError> {
        let job = match queue.find_pending_for_node(request.node_id).await? {
            Some(existing) => {
                tracing::debug!(job_id = %existing.job_id, node_id = %request.node_id, "Returning pending job");
                existing
            }
            None => queue.enqueue(&ImageJob::new(request, self.max_attempts)).await?,
        };

        Ok(SubmitOutcome {
            status: SubmitStatus::Queued,
            job_id: Some(job.job_id),
            image_url: None,
        })
    }

    async fn submit_inline(&self, request: &SubmitRequest) -> Result<SubmitOutcome, OrchestratorError> {
        let _guard = {
            let mut set = self
                .in_flight
                .lock()
                .map_err(|_| OrchestratorError::Data(Error::Internal("in-flight set poisoned".to_string())))?;
            if !set.insert(request.node_id) {
                return Err(OrchestratorError::InProgress(request.node_id));
            }
            InFlightGuard {
                set: &self.in_flight,
                node_id: request.node_id,
            }
        };

        let mut job = ImageJob::new(request, 1);
        job.status = JobStatus::Active;
        job.attempts = 1;

        let image_url = self.executor.execute(&job).await?;
        Ok(SubmitOutcome {
            status: SubmitStatus::Completed,
            job_id: None,
            image_url: Some(image_url),
        })
    }

    /// Current state of a queued job
    pub async fn job_status(&self, job_id: Uuid) -> Result<JobStatusView, OrchestratorError> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {}", job_id)))?;

        let job = queue
            .get(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {}", job_id)))?;
        Ok(JobStatusView::from(&job))
    }
}
