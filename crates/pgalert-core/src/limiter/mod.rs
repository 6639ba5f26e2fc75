//! Alert throttling: per-category cooldowns and the run-wide alert budget.

mod burst;

pub use burst::{BURST_COOLDOWN, BURST_THRESHOLD, BURST_WINDOW, BurstGuard};

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Health alert kinds that are throttled independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertCategory {
    ConnectionTotal,
    ConnectionActive,
    IdleInTransaction,
    LongQuery,
    Load,
    ReplicaLag,
    DataDirectory,
    WalDirectory,
    TempDirectory,
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConnectionTotal => "connections",
            Self::ConnectionActive => "active connections",
            Self::IdleInTransaction => "idle in transaction",
            Self::LongQuery => "long query",
            Self::Load => "load",
            Self::ReplicaLag => "replication",
            Self::DataDirectory => "data directory",
            Self::WalDirectory => "wal directory",
            Self::TempDirectory => "pgsql_tmp",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    #[default]
    PerCategory,
    /// One cooldown shared by every category.
    Global,
}

#[derive(Debug)]
pub struct RateLimiter {
    scope: RateLimitScope,
    last_fired: HashMap<Option<AlertCategory>, Instant>,
    total_fired: u64,
    max_alerts: u64,
}

impl RateLimiter {
    pub fn new(scope: RateLimitScope, max_alerts: u64) -> Self {
        Self {
            scope,
            last_fired: HashMap::new(),
            total_fired: 0,
            max_alerts,
        }
    }

    fn key(&self, category: AlertCategory) -> Option<AlertCategory> {
        match self.scope {
            RateLimitScope::PerCategory => Some(category),
            RateLimitScope::Global => None,
        }
    }

    /// True (and the category's clock restarts) when nothing fired in the
    /// category within the last `cooldown`.
    pub fn allow(&mut self, category: AlertCategory, now: Instant, cooldown: Duration) -> bool {
        let key = self.key(category);
        let allowed = self
            .last_fired
            .get(&key)
            .is_none_or(|last| now.saturating_duration_since(*last) > cooldown);
        if allowed {
            self.last_fired.insert(key, now);
        }
        allowed
    }

    pub fn record_fired(&mut self, count: u64) {
        self.total_fired += count;
    }

    pub fn total_fired(&self) -> u64 {
        self.total_fired
    }

    pub fn max_alerts(&self) -> u64 {
        self.max_alerts
    }

    pub fn budget_exceeded(&self) -> bool {
        self.total_fired > self.max_alerts
    }

    /// Applies refreshed settings; cooldown history is kept.
    pub fn reconfigure(&mut self, scope: RateLimitScope, max_alerts: u64) {
        if scope != self.scope {
            self.last_fired.clear();
        }
        self.scope = scope;
        self.max_alerts = max_alerts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: Duration = Duration::from_secs(300);

    #[test]
    fn test_cooldown_per_category() {
        let t0 = Instant::now();
        let mut limiter = RateLimiter::new(RateLimitScope::PerCategory, 100);

        assert!(limiter.allow(AlertCategory::Load, t0, C));
        assert!(!limiter.allow(AlertCategory::Load, t0 + C / 2, C));
        assert!(!limiter.allow(AlertCategory::Load, t0 + C, C));
        assert!(limiter.allow(AlertCategory::Load, t0 + C * 2, C));
        // other categories are independent
        assert!(limiter.allow(AlertCategory::LongQuery, t0 + C / 2, C));
    }

    #[test]
    fn test_global_scope_shares_cooldown() {
        let t0 = Instant::now();
        let mut limiter = RateLimiter::new(RateLimitScope::Global, 100);

        assert!(limiter.allow(AlertCategory::Load, t0, C));
        assert!(!limiter.allow(AlertCategory::LongQuery, t0 + C / 2, C));
    }

    #[test]
    fn test_budget() {
        let mut limiter = RateLimiter::new(RateLimitScope::PerCategory, 2);
        limiter.record_fired(2);
        assert!(!limiter.budget_exceeded());
        limiter.record_fired(1);
        assert!(limiter.budget_exceeded());
        assert_eq!(limiter.total_fired(), 3);

        limiter.reconfigure(RateLimitScope::PerCategory, 10);
        assert!(!limiter.budget_exceeded());
    }
}
