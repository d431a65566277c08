//! Client-side job polling
//!
//! A consumer of the HTTP API submits generation requests and watches queued
//! jobs until they finish, reflecting progress in a shared [`NodeViewState`].

pub mod http_client;
pub mod watcher;

pub use http_client::HttpJobClient;
pub use watcher::{GenerateOutcome, GenerationWatcher, PollConfig, PollState};

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::jobs::{JobStatusView, SubmitOutcome};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PollError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Unexpected response: {0}")]
    Decode(String),
}

/// Server operations the poll loop depends on
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn submit(&self, node_id: Uuid, timeline_id: Uuid, prompt: &str) -> Result<SubmitOutcome, PollError>;

    async fn job_status(&self, job_id: Uuid) -> Result<JobStatusView, PollError>;

    /// Persisted image URL of a node, if any
    async fn fetch_node_image(&self, timeline_id: Uuid, node_id: Uuid) -> Result<Option<String>, PollError>;
}

#[derive(Debug, Default)]
struct ViewInner {
    generating: HashSet<Uuid>,
    images: HashMap<Uuid, String>,
    failures: HashMap<Uuid, String>,
}

/// What the user currently sees for each node
#[derive(Debug, Default)]
pub struct NodeViewState {
    inner: Mutex<ViewInner>,
}

impl NodeViewState {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut ViewInner) -> R) -> R {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut inner)
    }

    /// Mark a node as generating; false if it already was
    pub fn begin_generating(&self, node_id: Uuid) -> bool {
        self.with(|v| {
            let started = v.generating.insert(node_id);
            if started {
                v.failures.remove(&node_id);
            }
            started
        })
    }

    pub fn finish_generating(&self, node_id: Uuid) {
        self.with(|v| {
            v.generating.remove(&node_id);
        })
    }

    pub fn is_generating(&self, node_id: Uuid) -> bool {
        self.with(|v| v.generating.contains(&node_id))
    }

    pub fn set_image(&self, node_id: Uuid, image_url: String) {
        self.with(|v| {
            v.images.insert(node_id, image_url);
        })
    }

    pub fn image(&self, node_id: Uuid) -> Option<String> {
        self.with(|v| v.images.get(&node_id).cloned())
    }

    pub fn set_failure(&self, node_id: Uuid, reason: String) {
        self.with(|v| {
            v.failures.insert(node_id, reason);
        })
    }

    pub fn failure(&self, node_id: Uuid) -> Option<String> {
        self.with(|v| v.failures.get(&node_id).cloned())
    }
}
