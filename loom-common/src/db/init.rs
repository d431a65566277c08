//! Database initialization
//!
//! Tables are created idempotently, so opening an existing database is the
//! same code path as creating a new one.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Open (or create) the on-disk database and ensure all tables exist
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL lets request handlers read while a worker writes job state
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_tables(&pool).await?;
    Ok(pool)
}

/// In-memory database with the full schema
///
/// Limited to one connection: every SQLite `:memory:` connection is a
/// separate database.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    create_tables(&pool).await?;
    Ok(pool)
}

/// Create every table used by the generation pipeline
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    create_nodes_table(pool).await?;
    create_branch_canon_table(pool).await?;
    create_creator_profiles_table(pool).await?;
    create_character_references_table(pool).await?;
    create_usage_records_table(pool).await?;
    create_image_jobs_table(pool).await?;
    Ok(())
}

pub async fn create_nodes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            node_id TEXT PRIMARY KEY,
            timeline_id TEXT NOT NULL,
            parent_id TEXT,
            branch_id TEXT,
            title TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            label TEXT,
            image_url TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_nodes_timeline ON nodes(timeline_id)")
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn create_branch_canon_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS branch_canon (
            branch_id TEXT PRIMARY KEY,
            setting TEXT NOT NULL DEFAULT '',
            characters TEXT NOT NULL DEFAULT '[]',
            tone TEXT NOT NULL DEFAULT '',
            rules TEXT NOT NULL DEFAULT '[]',
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_creator_profiles_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS creator_profiles (
            user_id TEXT PRIMARY KEY,
            preferred_genres TEXT NOT NULL DEFAULT '[]',
            writing_style TEXT NOT NULL DEFAULT '',
            favorite_themes TEXT NOT NULL DEFAULT '[]',
            disliked_elements TEXT NOT NULL DEFAULT '[]',
            exploration_ratio REAL NOT NULL DEFAULT 0.3,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_character_references_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS character_references (
            timeline_id TEXT NOT NULL,
            name TEXT NOT NULL,
            identity_block TEXT NOT NULL,
            portrait_url TEXT,
            PRIMARY KEY (timeline_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_usage_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usage_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            model TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_usage_user_time ON usage_records(user_id, created_at)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_image_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS image_jobs (
            job_id TEXT PRIMARY KEY,
            node_id TEXT NOT NULL,
            timeline_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            prompt TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            failure_reason TEXT,
            image_url TEXT,
            run_after TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            finished_at TEXT,
            lease_expires_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before claims carried a lease
    let has_lease: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('image_jobs') WHERE name = 'lease_expires_at'",
    )
    .fetch_one(pool)
    .await?;
    if has_lease == 0 {
        sqlx::query("ALTER TABLE image_jobs ADD COLUMN lease_expires_at TEXT")
            .execute(pool)
            .await?;
        info!("Added lease_expires_at column to image_jobs");
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_image_jobs_claim ON image_jobs(status, run_after)",
    )
    .execute(pool)
    .await?;
    // At most one queued or active job per node, across processes
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_image_jobs_pending_node \
         ON image_jobs(node_id) WHERE status IN ('queued', 'active')",
    )
    .execute(pool)
    .await?;
    Ok(())
}
