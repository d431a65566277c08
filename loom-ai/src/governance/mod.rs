//! Request governance
//!
//! Per-key sliding-window rate limits and per-user daily/monthly quotas,
//! owned by one [`Governance`] instance shared through application state.

pub mod middleware;
pub mod quota;
pub mod rate_limit;

pub use middleware::{governance_middleware, AuthenticatedUser, USER_ID_HEADER};
pub use quota::{QuotaEnforcer, QuotaExceeded, QuotaPeriod, QuotaStatus};
pub use rate_limit::{RateDecision, RateLimited, SlidingWindowLimiter};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use loom_common::config::GovernanceConfig;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Login and registration; keyed by client IP
    Auth,
    /// Text generation; keyed by user, quota-checked
    Text,
    /// Image generation; keyed by user, quota-checked
    Media,
    /// Health, job status and artifact reads
    Open,
}

impl EndpointClass {
    pub fn classify(path: &str) -> Self {
        if path.starts_with("/api/auth/") || path.starts_with("/auth/") {
            EndpointClass::Auth
        } else if path.starts_with("/api/ai/") {
            EndpointClass::Text
        } else if path.starts_with("/api/images/") {
            EndpointClass::Media
        } else {
            EndpointClass::Open
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Auth => "auth",
            EndpointClass::Text => "text",
            EndpointClass::Media => "media",
            EndpointClass::Open => "open",
        }
    }

    pub fn is_quota_checked(&self) -> bool {
        matches!(self, EndpointClass::Text | EndpointClass::Media)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GovernanceRejection {
    #[error("Rate limit of {limit} requests exceeded, retry in {retry_after_secs}s")]
    RateLimited {
        limit: usize,
        retry_after_secs: u64,
        reset_at: DateTime<Utc>,
    },

    #[error("{} quota of {} requests exhausted", .0.period.as_str(), .0.limit)]
    QuotaExceeded(QuotaExceeded),
}

/// What an admitted request may report back in its headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
    pub rate: Option<RateDecision>,
    pub quota: Option<QuotaStatus>,
}

pub struct Governance {
    limiter: SlidingWindowLimiter,
    quota: QuotaEnforcer,
    config: GovernanceConfig,
}

impl Governance {
    pub fn new(pool: SqlitePool, config: GovernanceConfig) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(Duration::from_secs(config.window_secs)),
            quota: QuotaEnforcer::new(pool, config.daily_limit, config.monthly_limit),
            config,
        }
    }

    pub fn limit_for(&self, class: EndpointClass) -> Option<usize> {
        match class {
            EndpointClass::Auth => Some(self.config.auth_per_window),
            EndpointClass::Text => Some(self.config.text_per_window),
            EndpointClass::Media => Some(self.config.media_per_window),
            EndpointClass::Open => None,
        }
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    /// Admit or reject one request of `class` for `key` (IP or user id)
    pub async fn admit(&self, class: EndpointClass, key: &str) -> Result<Admission, GovernanceRejection> {
        let Some(limit) = self.limit_for(class) else {
            return Ok(Admission::default());
        };

        let window_key = format!("{}:{}", class.as_str(), key);
        let admitted_at = Instant::now();
        let rate = self.limiter.check_at(&window_key, limit, admitted_at).map_err(|limited| {
            tracing::debug!(class = class.as_str(), key = %key, "Rate limit exceeded");
            GovernanceRejection::RateLimited {
                limit: limited.limit,
                retry_after_secs: limited.retry_after_secs,
                reset_at: Utc::now() + chrono::Duration::seconds(limited.retry_after_secs as i64),
            }
        })?;

        if !class.is_quota_checked() {
            return Ok(Admission {
                rate: Some(rate),
                quota: None,
            });
        }

        // Quota is enforced from persisted usage; an unreadable count admits the request
        let quota = match self.quota.status(key).await {
            Ok(status) => {
                if let Err(exceeded) = status.check() {
                    // A rejected request does not count against the rate window
                    self.limiter.release(&window_key, admitted_at);
                    tracing::info!(
                        user_id = %key,
                        period = exceeded.period.as_str(),
                        used = exceeded.used,
                        "Quota exhausted"
                    );
                    return Err(GovernanceRejection::QuotaExceeded(exceeded));
                }
                Some(status)
            }
            Err(e) => {
                tracing::warn!(user_id = %key, error = %e, "Quota lookup failed, admitting request");
                None
            }
        };

        Ok(Admission {
            rate: Some(rate),
            quota,
        })
    }
}

/// Periodically drop empty rate windows
pub fn spawn_sweep_task(
    governance: Arc<Governance>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = governance.limiter().sweep();
                    if removed > 0 {
                        tracing::debug!(removed, "Swept idle rate windows");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::usage::insert_usage;
    use crate::usage::UsageEntry;
    use loom_common::db::init_memory_database;

    fn config() -> GovernanceConfig {
        GovernanceConfig {
            auth_per_window: 2,
            text_per_window: 3,
            media_per_window: 1,
            daily_limit: 2,
            monthly_limit: 100,
            ..GovernanceConfig::default()
        }
    }

    #[test]
    fn test_classify_paths() {
        assert_eq!(EndpointClass::classify("/api/auth/login"), EndpointClass::Auth);
        assert_eq!(EndpointClass::classify("/auth/register"), EndpointClass::Auth);
        assert_eq!(EndpointClass::classify("/api/ai/suggest"), EndpointClass::Text);
        assert_eq!(EndpointClass::classify("/api/images/generate"), EndpointClass::Media);
        assert_eq!(EndpointClass::classify("/api/jobs/abc"), EndpointClass::Open);
        assert_eq!(EndpointClass::classify("/health"), EndpointClass::Open);
        assert_eq!(EndpointClass::classify("/media/t/n.png"), EndpointClass::Open);
    }

    #[tokio::test]
    async fn test_auth_class_is_rate_limited_without_quota() {
        let pool = init_memory_database().await.unwrap();
        let governance = Governance::new(pool, config());

        let first = governance.admit(EndpointClass::Auth, "10.0.0.7").await.unwrap();
        assert!(first.quota.is_none());
        assert_eq!(first.rate.unwrap().remaining, 1);
        governance.admit(EndpointClass::Auth, "10.0.0.7").await.unwrap();

        let err = governance.admit(EndpointClass::Auth, "10.0.0.7").await.unwrap_err();
        assert!(matches!(err, GovernanceRejection::RateLimited { limit: 2, .. }));
    }

    #[tokio::test]
    async fn test_quota_rejects_after_daily_limit() {
        let pool = init_memory_database().await.unwrap();
        for _ in 0..2 {
            insert_usage(
                &pool,
                &UsageEntry {
                    user_id: "u1".to_string(),
                    endpoint: "suggest".to_string(),
                    model: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        }
        let governance = Governance::new(pool, config());

        let err = governance.admit(EndpointClass::Text, "u1").await.unwrap_err();
        match err {
            GovernanceRejection::QuotaExceeded(exceeded) => {
                assert_eq!(exceeded.period, QuotaPeriod::Daily);
                assert_eq!(exceeded.limit, 2);
            }
            other => panic!("unexpected rejection: {:?}", other),
        }

        let ok = governance.admit(EndpointClass::Text, "u2").await.unwrap();
        assert_eq!(ok.quota.unwrap().daily_remaining(), 2);
    }

    #[tokio::test]
    async fn test_quota_rejection_leaves_rate_window_untouched() {
        let pool = init_memory_database().await.unwrap();
        for _ in 0..2 {
            insert_usage(
                &pool,
                &UsageEntry {
                    user_id: "u1".to_string(),
                    endpoint: "suggest".to_string(),
                    model: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        }
        let governance = Governance::new(pool, config());

        // More quota rejections than the window allows requests
        for _ in 0..5 {
            let err = governance.admit(EndpointClass::Text, "u1").await.unwrap_err();
            assert!(matches!(err, GovernanceRejection::QuotaExceeded(_)));
        }
        assert_eq!(governance.limiter().tracked_keys(), 0);

        let remaining = governance
            .limiter()
            .check("text:u1", 3)
            .unwrap()
            .remaining;
        assert_eq!(remaining, 2);
    }

    #[tokio::test]
    async fn test_classes_have_separate_windows() {
        let pool = init_memory_database().await.unwrap();
        let governance = Governance::new(pool, config());
        governance.admit(EndpointClass::Media, "u1").await.unwrap();
        assert!(governance.admit(EndpointClass::Media, "u1").await.is_err());
        assert!(governance.admit(EndpointClass::Text, "u1").await.is_ok());
        assert!(governance.admit(EndpointClass::Open, "u1").await.is_ok());
    }
}
