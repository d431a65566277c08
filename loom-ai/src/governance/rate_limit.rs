//! Sliding-window request limiter
//!
//! Each key keeps the timestamps of its admitted requests inside the current
//! window. Old timestamps are pruned lazily on every check and by the
//! periodic sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Admitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub limit: usize,
    pub remaining: usize,
    /// Until the oldest request in the window expires
    pub reset_after: Duration,
}

/// Rejected request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    pub limit: usize,
    /// Whole seconds, at least 1 and at most the window
    pub retry_after_secs: u64,
}

pub struct SlidingWindowLimiter {
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_secs(1)),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn check(&self, key: &str, limit: usize) -> Result<RateDecision, RateLimited> {
        self.check_at(key, limit, Instant::now())
    }

    /// Admit or reject one request for `key` at `now`
    pub fn check_at(&self, key: &str, limit: usize, now: Instant) -> Result<RateDecision, RateLimited> {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entries = windows.entry(key.to_string()).or_default();
        prune(entries, self.window, now);

        if entries.len() >= limit {
            let retry_after = entries
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or(self.window);
            return Err(RateLimited {
                limit,
                retry_after_secs: ceil_secs(retry_after).clamp(1, self.window.as_secs().max(1)),
            });
        }

        entries.push_back(now);
        let reset_after = entries
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(self.window);
        Ok(RateDecision {
            limit,
            remaining: limit - entries.len(),
            reset_after,
        })
    }

    /// Give back the slot admitted for `key` at `at`
    ///
    /// Used when a request passed the rate check but was rejected afterwards.
    pub fn release(&self, key: &str, at: Instant) {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now_empty = match windows.get_mut(key) {
            Some(entries) => {
                if let Some(pos) = entries.iter().rposition(|t| *t == at) {
                    entries.remove(pos);
                }
                entries.is_empty()
            }
            None => false,
        };
        if now_empty {
            windows.remove(key);
        }
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Drop keys whose windows are empty after pruning; returns how many were removed
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = windows.len();
        windows.retain(|_, entries| {
            prune(entries, self.window, now);
            !entries.is_empty()
        });
        before - windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }
}

fn prune(entries: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while let Some(oldest) = entries.front() {
        if now.saturating_duration_since(*oldest) >= window {
            entries.pop_front();
        } else {
            break;
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
