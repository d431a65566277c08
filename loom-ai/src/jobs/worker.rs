//! Background worker pool draining the job queue

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use loom_common::config::QueueConfig;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ImageJob, ImageJobExecutor, JobQueue};

/// How often finished jobs are pruned and lapsed claims recovered
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Shortest gap between lease renewals
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub jobs_per_minute: NonZeroU32,
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub fn from_queue_config(config: &QueueConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            jobs_per_minute: NonZeroU32::new(config.jobs_per_minute).unwrap_or(NonZeroU32::MIN),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_queue_config(&QueueConfig::default())
    }
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    executor: Arc<ImageJobExecutor>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, executor: Arc<ImageJobExecutor>, config: WorkerConfig) -> Self {
        Self {
            queue,
            executor,
            config,
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(config.jobs_per_minute))),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Claim and execute jobs until cancelled, then wait for in-flight jobs
    pub async fn run(self, cancel: CancellationToken) {
        let notify = self.queue.notifier();
        tracing::info!(
            concurrency = self.config.concurrency,
            jobs_per_minute = self.config.jobs_per_minute.get(),
            "Image worker pool started"
        );

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let claimed = tokio::select! {
                _ = cancel.cancelled() => break,
                claimed = self.queue.claim_next() => claimed,
            };

            match claimed {
                Ok(Some(job)) => {
                    // Throughput ceiling applies to claimed work only
                    self.limiter.until_ready().await;

                    let queue = Arc::clone(&self.queue);
                    let executor = Arc::clone(&self.executor);
                    tokio::spawn(async move {
                        run_job(queue.as_ref(), executor.as_ref(), job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(error = %e, "Failed to claim image job");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        tracing::info!("Image worker pool stopping, waiting for in-flight jobs");
        let _ = self.semaphore.acquire_many(self.config.concurrency as u32).await;
        tracing::info!("Image worker pool stopped");
    }
}

/// Lease renewal period: a third of the lease
fn heartbeat_interval(lease: Duration) -> Duration {
    (lease / 3).max(MIN_HEARTBEAT)
}

async fn run_job(queue: &dyn JobQueue, executor: &ImageJobExecutor, job: ImageJob) {
    tracing::debug!(job_id = %job.job_id, attempt = job.attempts, "Image job started");

    let execution = executor.execute(&job);
    tokio::pin!(execution);
    let period = heartbeat_interval(queue.lease_duration());
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            result = &mut execution => break result,
            _ = heartbeat.tick() => match queue.renew_lease(job.job_id).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!(job_id = %job.job_id, "Image job lease no longer held"),
                Err(e) => tracing::warn!(job_id = %job.job_id, error = %e, "Failed to renew image job lease"),
            },
        }
    };

    match result {
        Ok(url) => {
            if let Err(e) = queue.mark_completed(job.job_id, &url).await {
                tracing::error!(job_id = %job.job_id, error = %e, "Failed to mark image job completed");
                if let Err(e) = queue.mark_attempt_failed(&job, &e.to_string(), false).await {
                    tracing::error!(job_id = %job.job_id, error = %e, "Failed to record image job failure");
                }
            }
        }
        Err(e) => {
            let reason = e.to_string();
            if let Err(db_err) = queue.mark_attempt_failed(&job, &reason, e.is_retryable()).await {
                tracing::error!(job_id = %job.job_id, error = %db_err, "Failed to record image job failure");
            }
        }
    }
}

/// Periodically delete finished jobs past retention and requeue jobs whose lease lapsed
pub fn spawn_maintenance_task(
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match queue.prune().await {
                        Ok(0) => {}
                        Ok(count) => tracing::info!(count, "Pruned finished image jobs"),
                        Err(e) => tracing::warn!(error = %e, "Image job prune failed"),
                    }
                    if let Err(e) = queue.recover_interrupted().await {
                        tracing::warn!(error = %e, "Lapsed image job recovery failed");
                    }
                }
            }
        }
    })
}
