//! Database schema and story graph models

pub mod init;
pub mod models;

pub use init::{create_tables, init_database, init_memory_database};
pub use models::{BranchCanon, CanonCharacter, CharacterReference, CreatorProfile, PathNode, StoryNode};
