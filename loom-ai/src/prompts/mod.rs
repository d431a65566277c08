//! Prompt composer
//!
//! Every generation task is a variant of [`GenerationTask`] carrying its own
//! parameters. Prompts are built from ordered `[LABEL]` sections: style and
//! voice lead, the strictest output constraint closes. Wording is
//! affirmative throughout.

pub mod image;
pub mod output;
pub mod sections;
pub mod text;

pub use image::{character_extraction_prompt, setting_extraction_prompt};
pub use output::{
    CanonChange, CanonDiff, CanonOperation, CharacterExtraction, ExtractedCharacter, MergeProposal,
    SettingExtraction, Suggestion, SuggestionKind, SuggestionSet,
};
pub use sections::PromptBuilder;

use loom_common::db::{CharacterReference, CreatorProfile, PathNode};
use serde::Serialize;

use crate::context::AIContext;

pub const MAX_SUGGESTIONS: usize = 10;
pub const MAX_INSTRUCTIONS_CHARS: usize = 2_000;
pub const MAX_IMAGE_PROMPT_CHARS: usize = 4_000;
pub const MIN_EXPAND_WORDS: u32 = 50;
pub const MAX_EXPAND_WORDS: u32 = 2_000;
pub const DEFAULT_EXPAND_WORDS: u32 = 300;

/// Exploration ratio used when the user has no creator profile
pub const DEFAULT_EXPLORATION_RATIO: f64 = 0.3;

pub const DEFAULT_IMAGE_STYLE: &str =
    "Painterly digital illustration with cinematic lighting and a rich, coherent color palette.";

#[derive(Debug, Clone, PartialEq)]
pub struct SuggestParams {
    pub num_suggestions: usize,
    pub instructions: Option<String>,
    pub profile: Option<CreatorProfile>,
    /// Explicit ratio; overrides the profile when set
    pub exploration_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpandParams {
    pub target_words: u32,
    pub instructions: Option<String>,
    pub profile: Option<CreatorProfile>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonDiffParams {
    /// Text to compare against the canon; the target node's content when None
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeProposalParams {
    /// Root-first path of the branch being merged into the context's path
    pub incoming_path: Vec<PathNode>,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneImageParams {
    pub scene_description: String,
    pub setting: SettingExtraction,
    pub characters: Vec<ExtractedCharacter>,
    pub references: Vec<CharacterReference>,
    pub style: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortraitParams {
    pub name: String,
    pub description: String,
    pub style: Option<String>,
}

/// A unit of AI work
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationTask {
    Suggest(SuggestParams),
    Expand(ExpandParams),
    CanonDiff(CanonDiffParams),
    MergeProposal(MergeProposalParams),
    SceneImage(SceneImageParams),
    PortraitImage(PortraitParams),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Suggest,
    Expand,
    CanonDiff,
    MergeProposal,
    SceneImage,
    PortraitImage,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Suggest => "suggest",
            TaskKind::Expand => "expand",
            TaskKind::CanonDiff => "canon_diff",
            TaskKind::MergeProposal => "merge_proposal",
            TaskKind::SceneImage => "scene_image",
            TaskKind::PortraitImage => "portrait_image",
        }
    }
}

/// How many suggestions of each kind to ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExplorationSplit {
    pub exploratory: usize,
    pub aligned: usize,
}

impl ExplorationSplit {
    pub fn new(total: usize, ratio: f64) -> Self {
        let ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
        let exploratory = ((total as f64) * ratio).round() as usize;
        let exploratory = exploratory.min(total);
        Self {
            exploratory,
            aligned: total - exploratory,
        }
    }
}

impl SuggestParams {
    pub fn effective_ratio(&self) -> f64 {
        self.exploration_ratio
            .or_else(|| self.profile.as_ref().map(CreatorProfile::exploration_ratio))
            .unwrap_or(DEFAULT_EXPLORATION_RATIO)
    }

    pub fn split(&self) -> ExplorationSplit {
        ExplorationSplit::new(self.num_suggestions, self.effective_ratio())
    }
}

fn check_instructions(instructions: &Option<String>) -> Result<(), String> {
    match instructions {
        Some(text) if text.chars().count() > MAX_INSTRUCTIONS_CHARS => Err(format!(
            "instructions must be at most {} characters",
            MAX_INSTRUCTIONS_CHARS
        )),
        _ => Ok(()),
    }
}

fn check_required(field: &str, value: &str, max_chars: usize) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} must not be empty", field));
    }
    if value.chars().count() > max_chars {
        return Err(format!("{} must be at most {} characters", field, max_chars));
    }
    Ok(())
}

impl GenerationTask {
    pub fn kind(&self) -> TaskKind {
        match self {
            GenerationTask::Suggest(_) => TaskKind::Suggest,
            GenerationTask::Expand(_) => TaskKind::Expand,
            GenerationTask::CanonDiff(_) => TaskKind::CanonDiff,
            GenerationTask::MergeProposal(_) => TaskKind::MergeProposal,
            GenerationTask::SceneImage(_) => TaskKind::SceneImage,
            GenerationTask::PortraitImage(_) => TaskKind::PortraitImage,
        }
    }

    /// Check parameter bounds; the message is suitable for a 400 response
    pub fn validate(&self) -> Result<(), String> {
        match self {
            GenerationTask::Suggest(p) => {
                if p.num_suggestions == 0 || p.num_suggestions > MAX_SUGGESTIONS {
                    return Err(format!("num_suggestions must be between 1 and {}", MAX_SUGGESTIONS));
                }
                if let Some(ratio) = p.exploration_ratio {
                    if !(0.0..=1.0).contains(&ratio) {
                        return Err("exploration_ratio must be between 0 and 1".to_string());
                    }
                }
                check_instructions(&p.instructions)
            }
            GenerationTask::Expand(p) => {
                if !(MIN_EXPAND_WORDS..=MAX_EXPAND_WORDS).contains(&p.target_words) {
                    return Err(format!(
                        "target_words must be between {} and {}",
                        MIN_EXPAND_WORDS, MAX_EXPAND_WORDS
                    ));
                }
                check_instructions(&p.instructions)
            }
            GenerationTask::CanonDiff(p) => match &p.content {
                Some(content) => check_required("content", content, MAX_IMAGE_PROMPT_CHARS * 4),
                None => Ok(()),
            },
            GenerationTask::MergeProposal(p) => {
                if p.incoming_path.is_empty() {
                    return Err("incoming branch path must not be empty".to_string());
                }
                check_instructions(&p.instructions)
            }
            GenerationTask::SceneImage(p) => {
                check_required("prompt", &p.scene_description, MAX_IMAGE_PROMPT_CHARS)
            }
            GenerationTask::PortraitImage(p) => {
                check_required("name", &p.name, 200)?;
                check_required("description", &p.description, MAX_IMAGE_PROMPT_CHARS)
            }
        }
    }

    /// Render the full prompt for this task against `ctx`
    pub fn compose(&self, ctx: &AIContext) -> String {
        match self {
            GenerationTask::Suggest(p) => text::compose_suggest(ctx, p),
            GenerationTask::Expand(p) => text::compose_expand(ctx, p),
            GenerationTask::CanonDiff(p) => text::compose_canon_diff(ctx, p),
            GenerationTask::MergeProposal(p) => text::compose_merge(ctx, p),
            GenerationTask::SceneImage(p) => image::compose_scene(ctx, p),
            GenerationTask::PortraitImage(p) => image::compose_portrait(ctx, p),
        }
    }
}
