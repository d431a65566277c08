//! # Storyloom Common Library
//!
//! Shared code for the Storyloom generation services including:
//! - Story graph models (nodes, branch canon, creator profiles)
//! - SQLite schema initialization
//! - Configuration loading and root folder resolution
//! - Timestamp helpers for persisted records and quota boundaries

pub mod config;
pub mod db;
pub mod error;
pub mod time;

pub use error::{Error, Result};
