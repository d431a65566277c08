//! Image job execution
//!
//! One attempt: assemble context, extract setting and characters
//! concurrently, compose the scene prompt, generate, persist.

use std::sync::Arc;

use loom_common::Error;
use thiserror::Error as ThisError;
use uuid::Uuid;

use super::{ImageJob, MediaStore};
use crate::context::{AIContext, ContextAssembler, DEFAULT_SYSTEM_PROMPT};
use crate::prompts::{
    character_extraction_prompt, setting_extraction_prompt, CharacterExtraction, GenerationTask,
    PortraitParams, SceneImageParams, SettingExtraction, TaskKind,
};
use crate::provider::{self, ModelProvider, ProviderError};
use crate::store::GraphStore;
use crate::usage::{UsageEntry, UsageRecorder};

/// Token ceiling for the extraction calls
const EXTRACTION_MAX_TOKENS: u32 = 1_024;

#[derive(Debug, ThisError)]
pub enum JobError {
    #[error("Context assembly failed: {0}")]
    Context(Error),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Generation succeeded but the result could not be stored
    #[error("Failed to persist generated image: {0}")]
    Persistence(Error),
}

impl JobError {
    /// Whether the worker should schedule another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Provider(e) => e.is_retryable(),
            JobError::Context(Error::NotFound(_)) | JobError::Context(Error::InvalidInput(_)) => false,
            JobError::Context(_) => true,
            JobError::Persistence(_) => false,
        }
    }
}

/// A stored portrait
#[derive(Debug, Clone, PartialEq)]
pub struct PortraitResult {
    pub image_url: String,
    pub model: String,
    /// Whether a character reference row was updated with the portrait
    pub reference_updated: bool,
}

pub struct ImageJobExecutor {
    store: Arc<dyn GraphStore>,
    provider: Arc<dyn ModelProvider>,
    assembler: Arc<ContextAssembler>,
    media: MediaStore,
    usage: UsageRecorder,
}

impl ImageJobExecutor {
    pub fn new(
        store: Arc<dyn GraphStore>,
        provider: Arc<dyn ModelProvider>,
        assembler: Arc<ContextAssembler>,
        media: MediaStore,
        usage: UsageRecorder,
    ) -> Self {
        Self {
            store,
            provider,
            assembler,
            media,
            usage,
        }
    }

    /// Run one attempt, returning the stored image URL
    pub async fn execute(&self, job: &ImageJob) -> Result<String, JobError> {
        let started = std::time::Instant::now();

        let ctx = self
            .assembler
            .build_context(job.timeline_id, job.node_id, None)
            .await
            .map_err(JobError::Context)?;

        let scene = scene_text(job, &ctx);
        let prompt = self.build_scene_prompt(&ctx, job.timeline_id, &scene).await;

        let image = provider::generate_image(self.provider.as_ref(), &prompt, None).await?;

        let url = self
            .media
            .save(job.timeline_id, &job.node_id.to_string(), &image)
            .await
            .map_err(JobError::Persistence)?;
        self.store
            .set_node_image(job.node_id, &url)
            .await
            .map_err(JobError::Persistence)?;

        self.usage.record(UsageEntry {
            user_id: job.user_id.clone(),
            endpoint: TaskKind::SceneImage.as_str().to_string(),
            model: Some(image.model.clone()),
        });

        tracing::info!(
            job_id = %job.job_id,
            node_id = %job.node_id,
            attempt = job.attempts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scene image generated"
        );
        Ok(url)
    }

    /// Scene prompt for `scene`, with both extractions run concurrently
    ///
    /// A failed extraction contributes its empty default.
    pub async fn build_scene_prompt(&self, ctx: &AIContext, timeline_id: Uuid, scene: &str) -> String {
        let setting_prompt = setting_extraction_prompt(ctx, scene);
        let character_prompt = character_extraction_prompt(ctx, scene);

        let (setting, characters, references) = tokio::join!(
            provider::generate_structured::<SettingExtraction>(
                self.provider.as_ref(),
                &setting_prompt,
                None,
                Some(EXTRACTION_MAX_TOKENS),
            ),
            provider::generate_structured::<CharacterExtraction>(
                self.provider.as_ref(),
                &character_prompt,
                None,
                Some(EXTRACTION_MAX_TOKENS),
            ),
            self.assembler.character_references(timeline_id),
        );

        let setting = setting.map(|s| s.data).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Setting extraction failed, continuing without it");
            SettingExtraction::default()
        });
        let characters = characters.map(|c| c.data).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Character extraction failed, continuing without it");
            CharacterExtraction::default()
        });

        GenerationTask::SceneImage(SceneImageParams {
            scene_description: scene.to_string(),
            setting,
            characters: characters.characters,
            references,
            style: None,
        })
        .compose(ctx)
    }

    /// Generate and store a character portrait synchronously
    pub async fn render_portrait(
        &self,
        timeline_id: Uuid,
        branch_id: Option<Uuid>,
        params: PortraitParams,
        user_id: &str,
    ) -> Result<PortraitResult, JobError> {
        let branch_canon = match branch_id {
            Some(branch) => self.store.get_branch_canon(branch).await.unwrap_or_else(|e| {
                tracing::warn!(branch_id = %branch, error = %e, "Branch canon lookup failed, omitting");
                None
            }),
            None => None,
        };
        let ctx = AIContext {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            branch_canon,
            active_path: Vec::new(),
        };
        let name = params.name.trim().to_string();
        let prompt = GenerationTask::PortraitImage(params).compose(&ctx);

        let image = provider::generate_image(self.provider.as_ref(), &prompt, None).await?;
        let stem = format!("portrait-{}", slug(&name));
        let image_url = self
            .media
            .save(timeline_id, &stem, &image)
            .await
            .map_err(JobError::Persistence)?;
        let reference_updated = self
            .store
            .set_character_portrait(timeline_id, &name, &image_url)
            .await
            .map_err(JobError::Persistence)?;

        self.usage.record(UsageEntry {
            user_id: user_id.to_string(),
            endpoint: TaskKind::PortraitImage.as_str().to_string(),
            model: Some(image.model.clone()),
        });

        Ok(PortraitResult {
            image_url,
            model: image.model,
            reference_updated,
        })
    }
}

/// The user's scene direction, or the target node's own text when blank
fn scene_text(job: &ImageJob, ctx: &AIContext) -> String {
    if !job.prompt.trim().is_empty() {
        return job.prompt.trim().to_string();
    }
    ctx.target()
        .map(|n| format!("{}\n{}", n.title, n.content))
        .unwrap_or_default()
}

fn slug(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "character".to_string()
    } else {
        slug
    }
}
