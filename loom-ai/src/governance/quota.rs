//! Daily and monthly per-user quotas
//!
//! Counts come from persisted usage records, so quotas hold across restarts
//! and across processes sharing the database. Periods reset at local
//! midnight and on the first of the month.

use chrono::{DateTime, FixedOffset, Local, Utc};
use loom_common::time::{start_of_day, start_of_month, start_of_next_day, start_of_next_month};
use loom_common::Result;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::usage::count_since;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPeriod {
    Daily,
    Monthly,
}

impl QuotaPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaPeriod::Daily => "daily",
            QuotaPeriod::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaExceeded {
    pub period: QuotaPeriod,
    pub limit: u64,
    pub used: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaStatus {
    pub daily_limit: u64,
    pub daily_used: u64,
    pub daily_reset_at: DateTime<Utc>,
    pub monthly_limit: u64,
    pub monthly_used: u64,
    pub monthly_reset_at: DateTime<Utc>,
}

impl QuotaStatus {
    pub fn daily_remaining(&self) -> u64 {
        self.daily_limit.saturating_sub(self.daily_used)
    }

    pub fn monthly_remaining(&self) -> u64 {
        self.monthly_limit.saturating_sub(self.monthly_used)
    }

    /// Monthly breach is reported first since it outlasts the daily one
    pub fn check(&self) -> std::result::Result<(), QuotaExceeded> {
        if self.monthly_used >= self.monthly_limit {
            return Err(QuotaExceeded {
                period: QuotaPeriod::Monthly,
                limit: self.monthly_limit,
                used: self.monthly_used,
                reset_at: self.monthly_reset_at,
            });
        }
        if self.daily_used >= self.daily_limit {
            return Err(QuotaExceeded {
                period: QuotaPeriod::Daily,
                limit: self.daily_limit,
                used: self.daily_used,
                reset_at: self.daily_reset_at,
            });
        }
        Ok(())
    }
}

pub struct QuotaEnforcer {
    pool: SqlitePool,
    daily_limit: u64,
    monthly_limit: u64,
}

impl QuotaEnforcer {
    pub fn new(pool: SqlitePool, daily_limit: u64, monthly_limit: u64) -> Self {
        Self {
            pool,
            daily_limit,
            monthly_limit,
        }
    }

    pub async fn status(&self, user_id: &str) -> Result<QuotaStatus> {
        self.status_at(user_id, Local::now().fixed_offset()).await
    }

    /// Usage for `user_id` in the periods containing `now` (local time)
    pub async fn status_at(&self, user_id: &str, now: DateTime<FixedOffset>) -> Result<QuotaStatus> {
        let day_start = start_of_day(&now).with_timezone(&Utc);
        let month_start = start_of_month(&now).with_timezone(&Utc);

        let daily_used = count_since(&self.pool, user_id, day_start).await?;
        let monthly_used = count_since(&self.pool, user_id, month_start).await?;

        Ok(QuotaStatus {
            daily_limit: self.daily_limit,
            daily_used,
            daily_reset_at: start_of_next_day(&now).with_timezone(&Utc),
            monthly_limit: self.monthly_limit,
            monthly_used,
            monthly_reset_at: start_of_next_month(&now).with_timezone(&Utc),
        })
    }
}
