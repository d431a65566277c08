//! Generation watcher: submission plus one poll task per node

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::{JobStatusSource, NodeViewState, PollError};
use crate::jobs::{JobStatus, SubmitStatus};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_POLL_CEILING: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Pause between the end of one status check and the next
    pub interval: Duration,
    /// Total time a job is watched before giving up
    pub ceiling: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            ceiling: DEFAULT_POLL_CEILING,
        }
    }
}

/// One active poll
#[derive(Debug, Clone)]
pub struct PollState {
    pub node_id: Uuid,
    pub job_id: Uuid,
    pub started_at: Instant,
    pub cancelled: Arc<AtomicBool>,
}

impl PollState {
    fn new(node_id: Uuid, job_id: Uuid) -> Self {
        Self {
            node_id,
            job_id,
            started_at: Instant::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateOutcome {
    /// The node is already generating locally; nothing was submitted
    AlreadyGenerating,
    /// The image is available now
    Ready(Option<String>),
    /// A job was queued and is being watched
    Polling(Uuid),
}

type PollMap = Arc<Mutex<HashMap<Uuid, (PollState, JoinHandle<()>)>>>;

pub struct GenerationWatcher {
    source: Arc<dyn JobStatusSource>,
    view: Arc<NodeViewState>,
    config: PollConfig,
    polls: PollMap,
}

impl GenerationWatcher {
    pub fn new(source: Arc<dyn JobStatusSource>, view: Arc<NodeViewState>, config: PollConfig) -> Self {
        Self {
            source,
            view,
            config,
            polls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn view(&self) -> &Arc<NodeViewState> {
        &self.view
    }

    /// Submit generation for a node unless it is already generating
    pub async fn generate(
        &self,
        node_id: Uuid,
        timeline_id: Uuid,
        prompt: &str,
    ) -> Result<GenerateOutcome, PollError> {
        if !self.view.begin_generating(node_id) {
            return Ok(GenerateOutcome::AlreadyGenerating);
        }

        let outcome = match self.source.submit(node_id, timeline_id, prompt).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.view.set_failure(node_id, e.to_string());
                self.view.finish_generating(node_id);
                return Err(e);
            }
        };

        match outcome.status {
            SubmitStatus::Completed | SubmitStatus::AlreadyExists => {
                let url = match outcome.image_url {
                    Some(url) => Some(url),
                    None => self
                        .source
                        .fetch_node_image(timeline_id, node_id)
                        .await
                        .unwrap_or_else(|e| {
                            tracing::debug!(node_id = %node_id, error = %e, "Artifact fetch failed");
                            None
                        }),
                };
                if let Some(url) = &url {
                    self.view.set_image(node_id, url.clone());
                }
                self.view.finish_generating(node_id);
                Ok(GenerateOutcome::Ready(url))
            }
            SubmitStatus::Queued => match outcome.job_id {
                Some(job_id) => {
                    self.watch(node_id, timeline_id, job_id);
                    Ok(GenerateOutcome::Polling(job_id))
                }
                None => {
                    self.view.finish_generating(node_id);
                    Err(PollError::Decode("queued outcome without a job id".to_string()))
                }
            },
        }
    }

    /// Start polling `job_id` for a node; false if the node already has a poll
    pub fn watch(&self, node_id: Uuid, timeline_id: Uuid, job_id: Uuid) -> bool {
        let mut polls = match self.polls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((_, handle)) = polls.get(&node_id) {
            if !handle.is_finished() {
                return false;
            }
        }

        self.view.begin_generating(node_id);
        let state = PollState::new(node_id, job_id);
        let handle = tokio::spawn(poll_job(
            Arc::clone(&self.source),
            Arc::clone(&self.view),
            Arc::clone(&self.polls),
            state.clone(),
            timeline_id,
            self.config,
        ));
        polls.insert(node_id, (state, handle));
        true
    }

    pub fn is_watching(&self, node_id: Uuid) -> bool {
        self.polls
            .lock()
            .map(|p| p.get(&node_id).map(|(_, h)| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn active_polls(&self) -> usize {
        self.polls
            .lock()
            .map(|p| p.values().filter(|(_, h)| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Cancel every poll; results still in flight are discarded
    pub fn shutdown(&self) {
        let mut polls = match self.polls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (_, (state, handle)) in polls.drain() {
            state.cancel();
            handle.abort();
        }
    }
}

impl Drop for GenerationWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn poll_job(
    source: Arc<dyn JobStatusSource>,
    view: Arc<NodeViewState>,
    polls: PollMap,
    state: PollState,
    timeline_id: Uuid,
    config: PollConfig,
) {
    let node_id = state.node_id;

    loop {
        let elapsed = state.started_at.elapsed();
        if elapsed >= config.ceiling {
            if !state.is_cancelled() {
                tracing::debug!(node_id = %node_id, job_id = %state.job_id, "Job watch timed out");
                view.finish_generating(node_id);
            }
            break;
        }
        tokio::time::sleep(config.interval.min(config.ceiling - elapsed)).await;
        if state.is_cancelled() {
            return;
        }
        if state.started_at.elapsed() >= config.ceiling {
            continue;
        }

        let status = source.job_status(state.job_id).await;
        if state.is_cancelled() {
            return;
        }

        match status {
            Ok(job) => match job.status {
                JobStatus::Completed => {
                    let url = match job.image_url {
                        Some(url) => Some(url),
                        None => source.fetch_node_image(timeline_id, node_id).await.unwrap_or(None),
                    };
                    if state.is_cancelled() {
                        return;
                    }
                    if let Some(url) = url {
                        view.set_image(node_id, url);
                    }
                    view.finish_generating(node_id);
                    break;
                }
                JobStatus::Failed => {
                    let reason = job.error.unwrap_or_else(|| "generation failed".to_string());
                    view.set_failure(node_id, reason);
                    view.finish_generating(node_id);
                    break;
                }
                JobStatus::Queued | JobStatus::Active => {}
            },
            Err(e) => {
                tracing::debug!(node_id = %node_id, error = %e, "Job status check failed, will retry");
            }
        }
    }

    if let Ok(mut polls) = polls.lock() {
        let ours = polls.get(&node_id).map(|(s, _)| s.job_id == state.job_id).unwrap_or(false);
        if ours {
            polls.remove(&node_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobStatusView, SubmitOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Serves a fixed job status sequence, repeating the last entry
    struct ScriptedSource {
        statuses: Mutex<Vec<JobStatus>>,
        checks: AtomicUsize,
        submissions: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(statuses: Vec<JobStatus>) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses),
                checks: AtomicUsize::new(0),
                submissions: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobStatusSource for ScriptedSource {
        async fn submit(&self, _node: Uuid, _timeline: Uuid, _prompt: &str) -> Result<SubmitOutcome, PollError> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            Ok(SubmitOutcome {
                status: SubmitStatus::Queued,
                job_id: Some(Uuid::new_v4()),
                image_url: None,
            })
        }

        async fn job_status(&self, job_id: Uuid) -> Result<JobStatusView, PollError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            let status = {
                let mut statuses = self.statuses.lock().unwrap();
                if statuses.len() > 1 {
                    statuses.remove(0)
                } else {
                    statuses[0]
                }
            };
            Ok(JobStatusView {
                job_id,
                node_id: Uuid::nil(),
                status,
                error: (status == JobStatus::Failed).then(|| "provider timeout".to_string()),
                image_url: (status == JobStatus::Completed).then(|| "/media/t/n.png".to_string()),
                attempts: 1,
            })
        }

        async fn fetch_node_image(&self, _timeline: Uuid, _node: Uuid) -> Result<Option<String>, PollError> {
            Ok(None)
        }
    }

    fn watcher(source: Arc<ScriptedSource>) -> GenerationWatcher {
        GenerationWatcher::new(source, Arc::new(NodeViewState::new()), PollConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_clears_generating_and_stops() {
        let source = ScriptedSource::new(vec![JobStatus::Queued]);
        let watcher = watcher(Arc::clone(&source));
        let node = Uuid::new_v4();

        assert!(watcher.watch(node, Uuid::new_v4(), Uuid::new_v4()));
        assert!(watcher.view().is_generating(node));

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert!(watcher.view().is_generating(node));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!watcher.view().is_generating(node));
        assert!(watcher.view().failure(node).is_none());
        assert!(!watcher.is_watching(node));

        let checks = source.checks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.checks.load(Ordering::SeqCst), checks);
        assert!(checks <= 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_sets_image() {
        let source = ScriptedSource::new(vec![JobStatus::Queued, JobStatus::Active, JobStatus::Completed]);
        let watcher = watcher(Arc::clone(&source));
        let node = Uuid::new_v4();
        watcher.watch(node, Uuid::new_v4(), Uuid::new_v4());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(watcher.view().image(node).as_deref(), Some("/media/t/n.png"));
        assert!(!watcher.view().is_generating(node));
        assert_eq!(source.checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_records_reason() {
        let source = ScriptedSource::new(vec![JobStatus::Failed]);
        let watcher = watcher(source);
        let node = Uuid::new_v4();
        watcher.watch(node, Uuid::new_v4(), Uuid::new_v4());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(watcher.view().failure(node).as_deref(), Some("provider timeout"));
        assert!(!watcher.view().is_generating(node));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_poll_per_node_and_local_guard() {
        let source = ScriptedSource::new(vec![JobStatus::Queued]);
        let watcher = watcher(Arc::clone(&source));
        let node = Uuid::new_v4();
        let timeline = Uuid::new_v4();

        let first = watcher.generate(node, timeline, "").await.unwrap();
        assert!(matches!(first, GenerateOutcome::Polling(_)));
        let second = watcher.generate(node, timeline, "").await.unwrap();
        assert_eq!(second, GenerateOutcome::AlreadyGenerating);
        assert!(!watcher.watch(node, timeline, Uuid::new_v4()));

        assert_eq!(source.submissions.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.active_polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_late_results() {
        let source = ScriptedSource::new(vec![JobStatus::Completed]);
        let watcher = watcher(Arc::clone(&source));
        let node = Uuid::new_v4();
        watcher.watch(node, Uuid::new_v4(), Uuid::new_v4());

        watcher.shutdown();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(watcher.view().image(node).is_none());
        assert_eq!(source.checks.load(Ordering::SeqCst), 0);
        assert_eq!(watcher.active_polls(), 0);
    }
}
