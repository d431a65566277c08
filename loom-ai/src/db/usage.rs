//! Usage record persistence (one row per completed generation request)

use chrono::{DateTime, Utc};
use loom_common::time::to_db_timestamp;
use loom_common::Result;
use sqlx::SqlitePool;

use crate::usage::UsageEntry;

pub async fn insert_usage(pool: &SqlitePool, entry: &UsageEntry, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "INSERT INTO usage_records (user_id, endpoint, model, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&entry.user_id)
    .bind(&entry.endpoint)
    .bind(&entry.model)
    .bind(to_db_timestamp(at))
    .execute(pool)
    .await?;
    Ok(())
}

/// Requests recorded for `user_id` at or after `since`
pub async fn count_since(pool: &SqlitePool, user_id: &str, since: DateTime<Utc>) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM usage_records WHERE user_id = ? AND created_at >= ?",
    )
    .bind(user_id)
    .bind(to_db_timestamp(since))
    .fetch_one(pool)
    .await?;

    Ok(count.max(0) as u64)
}
