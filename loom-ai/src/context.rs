//! Context assembler
//!
//! Gathers the ancestor path, branch canon, creator profile and character
//! references a generation task needs. Read-only against the graph store.

use std::collections::HashSet;
use std::sync::Arc;

use loom_common::db::{BranchCanon, CharacterReference, CreatorProfile, PathNode};
use loom_common::{Error, Result};
use serde::Serialize;
use uuid::Uuid;

use crate::store::GraphStore;

/// Maximum number of parent hops walked from the target node
pub const MAX_ANCESTRY_DEPTH: usize = 200;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a collaborative fiction co-author working inside a branching story graph. \
Each node is one beat of a story. You write in the voice the story has already established and keep every \
continuation consistent with the path that leads to it.";

/// Everything a prompt needs to know about where a node sits in the story
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AIContext {
    pub system_prompt: String,
    pub branch_canon: Option<BranchCanon>,
    /// Root first; the last element is the target node
    pub active_path: Vec<PathNode>,
}

impl AIContext {
    /// The node the context was built for
    pub fn target(&self) -> Option<&PathNode> {
        self.active_path.last()
    }

    /// Concatenated path text, used for name matching
    pub fn path_text(&self) -> String {
        self.active_path
            .iter()
            .map(|n| format!("{}\n{}", n.title, n.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct ContextAssembler {
    store: Arc<dyn GraphStore>,
    system_prompt: String,
}

impl ContextAssembler {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    /// Build the context for `node_id` in `timeline_id`
    ///
    /// `branch_id` selects the canon to attach; when None the node's own
    /// branch is used. Missing or unreadable canon is omitted.
    pub async fn build_context(
        &self,
        timeline_id: Uuid,
        node_id: Uuid,
        branch_id: Option<Uuid>,
    ) -> Result<AIContext> {
        let node = self
            .store
            .get_node(timeline_id, node_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("node {} in timeline {}", node_id, timeline_id)))?;

        let ancestors = self.store.get_ancestry(node_id, MAX_ANCESTRY_DEPTH).await?;

        let mut visited = HashSet::from([node.node_id]);
        let mut active_path = Vec::with_capacity(ancestors.len() + 1);
        for ancestor in ancestors.iter().take(MAX_ANCESTRY_DEPTH) {
            if !visited.insert(ancestor.node_id) {
                tracing::warn!(
                    node_id = %node_id,
                    repeated = %ancestor.node_id,
                    "Cycle in parent links, truncating ancestry"
                );
                break;
            }
            active_path.push(ancestor.to_path_node());
        }
        active_path.reverse();
        active_path.push(node.to_path_node());

        let branch_canon = match branch_id.or(node.branch_id) {
            Some(branch) => match self.store.get_branch_canon(branch).await {
                Ok(canon) => canon,
                Err(e) => {
                    tracing::warn!(branch_id = %branch, error = %e, "Branch canon lookup failed, omitting");
                    None
                }
            },
            None => None,
        };

        tracing::debug!(
            node_id = %node_id,
            depth = active_path.len(),
            has_canon = branch_canon.is_some(),
            "Context assembled"
        );

        Ok(AIContext {
            system_prompt: self.system_prompt.clone(),
            branch_canon,
            active_path,
        })
    }

    /// Creator profile for a user; lookup failure degrades to None
    pub async fn creator_profile(&self, user_id: &str) -> Option<CreatorProfile> {
        match self.store.get_creator_profile(user_id).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Creator profile lookup failed");
                None
            }
        }
    }

    /// Character references for a timeline; lookup failure degrades to empty
    pub async fn character_references(&self, timeline_id: Uuid) -> Vec<CharacterReference> {
        match self.store.get_character_references(timeline_id).await {
            Ok(refs) => refs,
            Err(e) => {
                tracing::warn!(timeline_id = %timeline_id, error = %e, "Character reference lookup failed");
                Vec::new()
            }
        }
    }
}
