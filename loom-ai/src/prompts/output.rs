//! Shapes the model is asked to return for structured tasks

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    /// Takes the story somewhere new
    Exploratory,
    /// Continues in the established direction
    Aligned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub title: String,
    pub content: String,
    pub kind: SuggestionKind,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionSet {
    pub suggestions: Vec<Suggestion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonOperation {
    Add,
    Update,
    Remove,
}

/// One proposed edit to a branch canon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonChange {
    /// `setting`, `tone`, `characters` or `rules`
    pub field: String,
    pub operation: CanonOperation,
    pub value: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonDiff {
    #[serde(default)]
    pub changes: Vec<CanonChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeProposal {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub reconciled_points: Vec<String>,
}

/// Where and when a scene takes place
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingExtraction {
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub time_of_day: String,
    #[serde(default)]
    pub atmosphere: String,
}

impl SettingExtraction {
    pub fn is_empty(&self) -> bool {
        self.location.trim().is_empty()
            && self.time_of_day.trim().is_empty()
            && self.atmosphere.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedCharacter {
    pub name: String,
    #[serde(default)]
    pub appearance_notes: String,
    #[serde(default)]
    pub action: String,
}

/// People visible in a scene
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterExtraction {
    #[serde(default)]
    pub characters: Vec<ExtractedCharacter>,
}
