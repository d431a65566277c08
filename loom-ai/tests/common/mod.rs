//! Shared fixtures for loom-ai integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use loom_ai::db::SqliteGraphStore;
use loom_ai::provider::{ImageOutput, ImageRequest, ModelProvider, ProviderError, TextOutput, TextRequest};
use loom_ai::AppState;
use loom_common::config::TomlConfig;
use loom_common::db::{init_memory_database, StoryNode};
use sqlx::SqlitePool;
use tokio::sync::Notify;
use uuid::Uuid;

pub const TEST_USER: &str = "user-1";
pub const FAKE_MODEL: &str = "fake-model";

/// Smallest valid PNG signature plus padding; the bytes are never decoded
pub const FAKE_PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake-image-bytes";

/// Provider answering from a script of prompt substrings
///
/// Text prompts are matched against the rules in order; the first rule whose
/// needle occurs in the prompt supplies the reply. Unmatched prompts get
/// `EmptyResponse`.
pub struct ScriptedProvider {
    rules: Mutex<Vec<(String, Result<String, ProviderError>)>>,
    image: Mutex<Result<ImageOutput, ProviderError>>,
    image_gate: Option<Arc<Notify>>,
    text_calls: AtomicUsize,
    image_calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            image: Mutex::new(Ok(png_output())),
            image_gate: None,
            text_calls: AtomicUsize::new(0),
            image_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Answer text prompts containing `needle` with `reply`
    pub fn on_text(self, needle: &str, reply: &str) -> Self {
        self.rules.lock().unwrap().push((needle.to_string(), Ok(reply.to_string())));
        self
    }

    /// Fail text prompts containing `needle`
    pub fn fail_text(self, needle: &str, error: ProviderError) -> Self {
        self.rules.lock().unwrap().push((needle.to_string(), Err(error)));
        self
    }

    pub fn with_image(self, image: Result<ImageOutput, ProviderError>) -> Self {
        *self.image.lock().unwrap() = image;
        self
    }

    /// Block every image call until the gate is notified
    pub fn with_image_gate(mut self, gate: Arc<Notify>) -> Self {
        self.image_gate = Some(gate);
        self
    }

    /// Answers both scene extraction prompts with empty results
    pub fn with_empty_extractions(self) -> Self {
        self.on_text("\"time_of_day\"", r#"{"location": "", "time_of_day": "", "atmosphere": ""}"#)
            .on_text("\"appearance_notes\"", r#"{"characters": []}"#)
    }

    pub fn text_calls(&self) -> usize {
        self.text_calls.load(Ordering::SeqCst)
    }

    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    /// Every prompt received so far, text and image
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn complete_text(&self, request: TextRequest) -> Result<TextOutput, ProviderError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let reply = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| request.prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone());
        match reply {
            Some(Ok(text)) => Ok(TextOutput {
                text,
                model: FAKE_MODEL.to_string(),
            }),
            Some(Err(e)) => Err(e),
            None => Err(ProviderError::EmptyResponse),
        }
    }

    async fn complete_image(&self, request: ImageRequest) -> Result<ImageOutput, ProviderError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        if let Some(gate) = &self.image_gate {
            gate.notified().await;
        }
        self.image.lock().unwrap().clone()
    }
}

pub fn png_output() -> ImageOutput {
    ImageOutput {
        image: FAKE_PNG.to_vec(),
        mime_type: "image/png".to_string(),
        text: None,
        model: FAKE_MODEL.to_string(),
    }
}

/// Config with the queue toggled and generous governance limits
pub fn test_config(queue_enabled: bool) -> TomlConfig {
    let mut config = TomlConfig::default();
    config.queue.enabled = queue_enabled;
    config.queue.backoff_base_ms = 10;
    config.queue.poll_interval_ms = 20;
    config.queue.jobs_per_minute = 600;
    config.governance.text_per_window = 100;
    config.governance.media_per_window = 100;
    config
}

pub async fn test_state(
    provider: Arc<ScriptedProvider>,
    config: TomlConfig,
    media_root: &Path,
) -> AppState {
    let pool = init_memory_database().await.unwrap();
    AppState::new(pool, media_root.to_path_buf(), config, provider, true)
}

/// A two-node story: root "The Gate" and its child "The Crossing"
pub struct StoryFixture {
    pub timeline_id: Uuid,
    pub root: StoryNode,
    pub child: StoryNode,
}

pub async fn seed_story(pool: &SqlitePool) -> StoryFixture {
    let store = SqliteGraphStore::new(pool.clone());
    let timeline_id = Uuid::new_v4();
    let root = StoryNode {
        node_id: Uuid::new_v4(),
        timeline_id,
        parent_id: None,
        branch_id: None,
        title: "The Gate".to_string(),
        content: "Mara stands before the rusted gate at dusk.".to_string(),
        label: None,
        image_url: None,
    };
    let child = StoryNode {
        node_id: Uuid::new_v4(),
        timeline_id,
        parent_id: Some(root.node_id),
        branch_id: None,
        title: "The Crossing".to_string(),
        content: "She climbs through and the fog closes behind her.".to_string(),
        label: None,
        image_url: None,
    };
    store.insert_node(&root).await.unwrap();
    store.insert_node(&child).await.unwrap();
    StoryFixture {
        timeline_id,
        root,
        child,
    }
}
