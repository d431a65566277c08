//! loom-ai library interface
//!
//! AI generation service for Storyloom story graphs: context assembly,
//! prompt composition, model invocation, image jobs, request governance
//! and the HTTP API. Exposed as a library for integration testing and for
//! Rust clients that use the poll loop.

pub mod api;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod governance;
pub mod jobs;
pub mod poll;
pub mod prompts;
pub mod provider;
pub mod store;
pub mod usage;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, Router};
use chrono::{DateTime, Utc};
use loom_common::config::TomlConfig;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::context::ContextAssembler;
use crate::db::SqliteGraphStore;
use crate::governance::{governance_middleware, Governance};
use crate::jobs::{
    spawn_maintenance_task, ImageJobExecutor, JobOrchestrator, JobQueue, MediaStore, RetentionPolicy, RetryPolicy,
    SqliteJobQueue, WorkerConfig, WorkerPool,
};
use crate::provider::ModelProvider;
use crate::store::GraphStore;
use crate::usage::{UsageRecorder, DEFAULT_USAGE_QUEUE_CAPACITY};

/// Longest wait for queued usage records at shutdown
pub const USAGE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    pub store: Arc<dyn GraphStore>,
    pub provider: Arc<dyn ModelProvider>,
    /// False when no API key was resolved at startup
    pub provider_configured: bool,
    pub assembler: Arc<ContextAssembler>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub governance: Arc<Governance>,
    pub usage: UsageRecorder,
    /// Background task draining `usage`, taken by [`AppState::shutdown`]
    usage_writer: Arc<Mutex<Option<JoinHandle<()>>>>,
    pub media: MediaStore,
    pub config: Arc<TomlConfig>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last server-side error, for diagnostics
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    /// Wire the service over an initialized database and media directory
    pub fn new(
        db: SqlitePool,
        media_root: PathBuf,
        config: TomlConfig,
        provider: Arc<dyn ModelProvider>,
        provider_configured: bool,
    ) -> Self {
        let store: Arc<dyn GraphStore> = Arc::new(SqliteGraphStore::new(db.clone()));
        let assembler = Arc::new(ContextAssembler::new(Arc::clone(&store)));
        let media = MediaStore::new(media_root);
        let (usage, usage_writer) = UsageRecorder::spawn(db.clone(), DEFAULT_USAGE_QUEUE_CAPACITY);

        let executor = Arc::new(ImageJobExecutor::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            Arc::clone(&assembler),
            media.clone(),
            usage.clone(),
        ));

        let queue_config = &config.queue;
        let queue: Option<Arc<dyn JobQueue>> = if queue_config.enabled {
            Some(Arc::new(
                SqliteJobQueue::new(
                    db.clone(),
                    RetryPolicy::new(Duration::from_millis(queue_config.backoff_base_ms)),
                    RetentionPolicy {
                        completed: Duration::from_secs(queue_config.completed_retention_secs),
                        failed: Duration::from_secs(queue_config.failed_retention_secs),
                    },
                )
                .with_lease(Duration::from_secs(queue_config.lease_secs.max(1))),
            ))
        } else {
            None
        };

        let orchestrator = Arc::new(JobOrchestrator::new(
            Arc::clone(&store),
            executor,
            queue,
            queue_config.max_attempts,
        ));
        let governance = Arc::new(Governance::new(db.clone(), config.governance.clone()));

        Self {
            db,
            store,
            provider,
            provider_configured,
            assembler,
            orchestrator,
            governance,
            usage,
            usage_writer: Arc::new(Mutex::new(Some(usage_writer))),
            media,
            config: Arc::new(config),
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Start the worker pool, queue maintenance and sweep tasks
    ///
    /// Active jobs whose lease lapsed, such as those of a crashed process,
    /// are requeued first.
    pub async fn spawn_background(&self, cancel: CancellationToken) -> loom_common::Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        if let Some(queue) = self.orchestrator.queue() {
            queue.recover_interrupted().await?;

            let worker = WorkerPool::new(
                Arc::clone(queue),
                Arc::clone(self.orchestrator.executor()),
                WorkerConfig::from_queue_config(&self.config.queue),
            );
            handles.push(worker.spawn(cancel.clone()));
            handles.push(spawn_maintenance_task(
                Arc::clone(queue),
                jobs::worker::MAINTENANCE_INTERVAL,
                cancel.clone(),
            ));
        } else {
            tracing::info!("Job queue disabled, image generation runs inline");
        }

        handles.push(governance::spawn_sweep_task(
            Arc::clone(&self.governance),
            Duration::from_secs(self.config.governance.sweep_interval_secs),
            cancel,
        ));
        Ok(handles)
    }

    /// Write out usage records still queued, then stop the usage writer
    ///
    /// Call after the server and background tasks have stopped.
    pub async fn shutdown(&self) {
        match tokio::time::timeout(USAGE_FLUSH_TIMEOUT, self.usage.flush()).await {
            Ok(true) => tracing::info!("Usage records flushed"),
            Ok(false) => tracing::error!("Usage writer stopped early, queued usage records were lost"),
            Err(_) => tracing::warn!(
                timeout_secs = USAGE_FLUSH_TIMEOUT.as_secs(),
                "Timed out flushing usage records"
            ),
        }

        let Some(writer) = self.usage_writer.lock().await.take() else {
            return;
        };
        if writer.is_finished() {
            if let Err(e) = writer.await {
                tracing::error!(error = %e, "Usage writer ended abnormally");
            }
        } else {
            writer.abort();
        }
    }

    /// Remember a server-side failure for the health endpoint
    pub fn track(&self, err: impl Into<ApiError>) -> ApiError {
        let err = err.into();
        if err.status().is_server_error() {
            if let Ok(mut slot) = self.last_error.try_write() {
                *slot = Some(err.to_string());
            }
        }
        err
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    let media_dir = state.media.root().to_path_buf();
    let governance = Arc::clone(&state.governance);

    Router::new()
        .merge(api::health_routes())
        .merge(api::image_routes())
        .merge(api::job_routes())
        .merge(api::text_routes())
        .nest_service("/media", ServeDir::new(media_dir))
        .layer(middleware::from_fn_with_state(governance, governance_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
