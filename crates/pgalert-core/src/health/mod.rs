//! Periodic health checks.
//!
//! Each [`HealthProbe`] inspects one area (host, database) and raises alert
//! texts through a [`CheckContext`], which applies the per-category
//! cooldown. The monitor feeds the raised texts into the same buffer as log
//! alerts.

mod db;
mod host;

pub use db::{
    ConnectionStats, DbCounters, DbHealth, LongQuery, ReplicaRow, connection_alerts,
    dbstat_alerts, long_query_alert, replica_alerts,
};
pub use host::{HostHealth, MountUsage, dir_size, format_bytes, usage_for_path};

use crate::config::Config;
use crate::limiter::{AlertCategory, RateLimiter};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("database check failed: {0}")]
    Database(String),
    #[error("cannot read {what}: {reason}")]
    Host { what: String, reason: String },
}

/// State shared by the probes during one check cycle.
pub struct CheckContext<'a> {
    pub config: &'a Config,
    limiter: &'a mut RateLimiter,
    now: Instant,
    stamp: String,
    alerts: Vec<String>,
}

impl<'a> CheckContext<'a> {
    pub fn new(config: &'a Config, limiter: &'a mut RateLimiter, now: Instant, stamp: String) -> Self {
        Self {
            config,
            limiter,
            now,
            stamp,
            alerts: Vec::new(),
        }
    }

    /// Raises an alert unless its category is cooling down.
    pub fn raise(&mut self, category: AlertCategory, text: impl AsRef<str>) {
        let cooldown = self.config.health_cooldown();
        if self.limiter.allow(category, self.now, cooldown) {
            self.raise_unthrottled(text);
        } else {
            debug!(%category, "health alert suppressed by cooldown");
        }
    }

    /// Raises an alert that is not subject to cooldowns.
    pub fn raise_unthrottled(&mut self, text: impl AsRef<str>) {
        self.alerts.push(format!("{}  {}", self.stamp, text.as_ref()));
    }

    pub fn into_alerts(self) -> Vec<String> {
        self.alerts
    }
}

pub trait HealthProbe: Send {
    fn name(&self) -> &'static str;

    fn check(&mut self, ctx: &mut CheckContext<'_>) -> Result<(), HealthError>;
}

/// Runs every probe in order. A failing probe is logged and skipped.
#[derive(Default)]
pub struct HealthSuite {
    probes: Vec<Box<dyn HealthProbe>>,
}

impl HealthSuite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, probe: Box<dyn HealthProbe>) {
        self.probes.push(probe);
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn run(
        &mut self,
        config: &Config,
        limiter: &mut RateLimiter,
        now: Instant,
        stamp: String,
    ) -> Vec<String> {
        let mut ctx = CheckContext::new(config, limiter, now, stamp);
        for probe in &mut self.probes {
            if let Err(e) = probe.check(&mut ctx) {
                warn!(probe = probe.name(), error = %e, "health check failed");
            }
        }
        ctx.into_alerts()
    }
}
