//! Story graph models shared by the storage layer and the generation pipeline

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A node row as stored in the story graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryNode {
    pub node_id: Uuid,
    pub timeline_id: Uuid,
    /// None for a root node
    pub parent_id: Option<Uuid>,
    pub branch_id: Option<Uuid>,
    pub title: String,
    pub content: String,
    pub label: Option<String>,
    /// Persisted illustration, if one was generated
    pub image_url: Option<String>,
}

impl StoryNode {
    pub fn to_path_node(&self) -> PathNode {
        PathNode {
            node_id: self.node_id,
            title: self.title.clone(),
            content: self.content.clone(),
            label: self.label.clone(),
        }
    }
}

/// One entry on the ancestor chain from root to a target node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathNode {
    pub node_id: Uuid,
    pub title: String,
    pub content: String,
    pub label: Option<String>,
}

/// World-state facts scoped to one narrative branch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchCanon {
    pub branch_id: Uuid,
    #[serde(default)]
    pub setting: String,
    #[serde(default)]
    pub characters: Vec<CanonCharacter>,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonCharacter {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Per-user stylistic preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatorProfile {
    #[serde(default)]
    pub preferred_genres: Vec<String>,
    #[serde(default)]
    pub writing_style: String,
    #[serde(default)]
    pub favorite_themes: Vec<String>,
    #[serde(default)]
    pub disliked_elements: Vec<String>,
    /// Share of suggestions that should be exploratory, in [0, 1]
    pub exploration_ratio: f64,
}

impl CreatorProfile {
    /// Exploration ratio clamped into [0, 1]; NaN counts as 0
    pub fn exploration_ratio(&self) -> f64 {
        if self.exploration_ratio.is_nan() {
            0.0
        } else {
            self.exploration_ratio.clamp(0.0, 1.0)
        }
    }
}

/// Stored identity description for a named character in a timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterReference {
    pub timeline_id: Uuid,
    pub name: String,
    /// Canonical appearance text, inserted verbatim into image prompts
    pub identity_block: String,
    pub portrait_url: Option<String>,
}
