//! Graph storage collaborator
//!
//! The generation pipeline reads nodes, ancestry, canon, profiles and
//! character references, and writes only image references.

use async_trait::async_trait;
use loom_common::db::{BranchCanon, CharacterReference, CreatorProfile, StoryNode};
use loom_common::Result;
use uuid::Uuid;

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Node by id, scoped to a timeline
    async fn get_node(&self, timeline_id: Uuid, node_id: Uuid) -> Result<Option<StoryNode>>;

    /// Parent chain of a node, nearest ancestor first, excluding the node itself.
    /// At most `max_depth` entries are returned.
    async fn get_ancestry(&self, node_id: Uuid, max_depth: usize) -> Result<Vec<StoryNode>>;

    async fn set_node_image(&self, node_id: Uuid, image_url: &str) -> Result<()>;

    async fn get_branch_canon(&self, branch_id: Uuid) -> Result<Option<BranchCanon>>;

    async fn get_creator_profile(&self, user_id: &str) -> Result<Option<CreatorProfile>>;

    async fn get_character_references(&self, timeline_id: Uuid) -> Result<Vec<CharacterReference>>;

    /// Record the portrait generated for a named character, if a reference exists
    async fn set_character_portrait(
        &self,
        timeline_id: Uuid,
        name: &str,
        portrait_url: &str,
    ) -> Result<bool>;
}
