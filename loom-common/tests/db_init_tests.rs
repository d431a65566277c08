//! Database initialization tests

use loom_common::db::{init_database, init_memory_database};
use tempfile::TempDir;

async fn table_names(pool: &sqlx::SqlitePool) -> Vec<String> {
    sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .unwrap()
}

#[tokio::test]
async fn test_memory_database_has_all_tables() {
    let pool = init_memory_database().await.unwrap();
    let tables = table_names(&pool).await;

    for expected in [
        "branch_canon",
        "character_references",
        "creator_profiles",
        "image_jobs",
        "nodes",
        "usage_records",
    ] {
        assert!(tables.contains(&expected.to_string()), "missing table {}", expected);
    }
}

#[tokio::test]
async fn test_init_creates_file_and_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("storyloom.db");

    let pool = init_database(&db_path).await.unwrap();
    assert!(db_path.exists());
    pool.close().await;

    // Second open runs CREATE TABLE IF NOT EXISTS against existing tables
    let pool = init_database(&db_path).await.unwrap();
    assert_eq!(table_names(&pool).await.len(), 6);
}
