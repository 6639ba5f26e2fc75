//! The monitoring loop.
//!
//! One thread of control polls the log source about once a second, runs
//! health checks on their cadence, refreshes config and source identity
//! every `refresh_rate` minutes, and dispatches buffered alerts whenever the
//! source has nothing new. Every way out of the loop goes through the same
//! shutdown sequence.

mod clock;
#[cfg(test)]
mod scenarios;

pub use clock::{Clock, ManualClock, SystemClock};

use crate::buffer::AlertBuffer;
use crate::classifier::{Classification, Decision, LineClassifier, LogLine};
use crate::config::{Config, ConfigSource};
use crate::health::HealthSuite;
use crate::limiter::{BurstGuard, RateLimiter};
use crate::notify::{DeliveryError, Notifier};
use crate::source::{LineSource, SourceError};
use crate::watermark::Watermark;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_INTERRUPTED: i32 = -2;
pub const EXIT_ALREADY_RUNNING: i32 = -3;

/// Sleep when the source has no new line.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Sleep between suspension polls.
pub const SUSPENDED_POLL: Duration = Duration::from_secs(60);
/// Longest single sleep during a burst pause.
pub const PAUSED_WAKEUP: Duration = Duration::from_secs(15);
/// Sleep after a failed read.
pub const READ_RETRY_DELAY: Duration = Duration::from_secs(5);

const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("log source lost: {0}")]
    Source(#[from] SourceError),
    #[error("alert delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}

#[derive(Debug)]
pub enum RunOutcome {
    /// The configured run time elapsed.
    Completed,
    MaxAlertsExceeded,
    Interrupted,
    Failed(MonitorError),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed | Self::MaxAlertsExceeded => EXIT_OK,
            Self::Interrupted => EXIT_INTERRUPTED,
            Self::Failed(_) => EXIT_ERROR,
        }
    }
}

/// Collaborators the loop drives.
pub struct MonitorParts {
    pub source: Box<dyn LineSource>,
    pub notifier: Box<dyn Notifier>,
    pub health: HealthSuite,
    pub config_source: Box<dyn ConfigSource>,
    pub clock: Box<dyn Clock>,
}

pub struct Monitor {
    config: Config,
    classifier: LineClassifier,
    watermark: Watermark,
    limiter: RateLimiter,
    burst: BurstGuard,
    buffer: AlertBuffer,
    source: Box<dyn LineSource>,
    notifier: Box<dyn Notifier>,
    health: HealthSuite,
    config_source: Box<dyn ConfigSource>,
    clock: Box<dyn Clock>,
    interrupt: Arc<AtomicBool>,
    deadline: Instant,
    last_refresh: Instant,
    next_health: Instant,
}

impl Monitor {
    pub fn new(
        config: Config,
        classifier: LineClassifier,
        parts: MonitorParts,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        let now = parts.clock.now();
        let deadline = run_deadline(now, config.run.minutes);
        Self {
            deadline,
            limiter: RateLimiter::new(config.run.rate_limit_scope, config.run.max_alerts),
            config,
            classifier,
            watermark: Watermark::new(),
            burst: BurstGuard::default(),
            buffer: AlertBuffer::new(),
            source: parts.source,
            notifier: parts.notifier,
            health: parts.health,
            config_source: parts.config_source,
            clock: parts.clock,
            interrupt,
            last_refresh: now,
            next_health: now,
        }
    }

    pub fn total_fired(&self) -> u64 {
        self.limiter.total_fired()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs until a terminal condition, then shuts down.
    pub fn run(&mut self) -> RunOutcome {
        info!(
            cluster = %self.config.run.clusterid,
            minutes = self.config.run.minutes,
            max_alerts = self.config.run.max_alerts,
            check_interval = self.config.run.check_interval,
            sqlstate_checks = self.classifier.sqlstate_enabled(),
            "monitoring started"
        );
        let outcome = match self.drive() {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "monitoring failed");
                RunOutcome::Failed(e)
            }
        };
        self.shutdown(&outcome);
        outcome
    }

    fn drive(&mut self) -> Result<RunOutcome, MonitorError> {
        loop {
            if self.interrupt.load(Ordering::SeqCst) {
                info!("interrupt received");
                return Ok(RunOutcome::Interrupted);
            }
            let now = self.clock.now();
            if now >= self.deadline {
                info!("monitoring period over");
                return Ok(RunOutcome::Completed);
            }
            if now.saturating_duration_since(self.last_refresh) >= self.config.refresh_period() {
                self.refresh(now)?;
            }
            if now >= self.next_health {
                self.run_health(now)?;
            }
            if self.limiter.budget_exceeded() {
                self.stop_on_budget()?;
                return Ok(RunOutcome::MaxAlertsExceeded);
            }
            if self.burst.is_paused(now) {
                self.flush()?;
                let nap = self.burst.remaining(now).min(PAUSED_WAKEUP);
                trace!(?nap, "burst pause");
                self.clock.sleep(nap);
                continue;
            }
            if self.config.run.suspended {
                self.idle_suspended()?;
                continue;
            }

            match self.source.next_line() {
                Ok(Some(raw)) => self.process_line(&raw, now)?,
                Ok(None) => {
                    self.flush()?;
                    self.clock.sleep(POLL_INTERVAL);
                }
                Err(SourceError::Closed) => return Err(SourceError::Closed.into()),
                Err(e) => {
                    warn!(error = %e, "reading log source failed, retrying");
                    self.clock.sleep(READ_RETRY_DELAY);
                }
            }
        }
    }

    fn stamp(&self) -> String {
        self.clock.wall().format(STAMP_FORMAT).to_string()
    }

    fn process_line(&mut self, raw: &str, now: Instant) -> Result<(), MonitorError> {
        let line = LogLine::parse(raw);
        if line.text().is_empty() || !self.classifier.admits(line.text()) {
            return Ok(());
        }
        let Classification { decision, sqlstate } =
            self.classifier.classify(&line, &self.config.filters);
        match decision {
            Decision::Invalid => {
                trace!(line = line.text(), "line without timestamp skipped");
                Ok(())
            }
            Decision::Suppress(reason) => {
                debug!(%reason, sqlstate = ?sqlstate, "suppressed: {}", line.text());
                Ok(())
            }
            Decision::Alert => {
                let Some(ts) = line.timestamp() else {
                    return Ok(());
                };
                if !self.watermark.admit(ts, line.text()) {
                    debug!(
                        ts,
                        watermark = ?self.watermark.current(),
                        "already alerted on this line, skipping"
                    );
                    return Ok(());
                }
                debug!(sqlstate = ?sqlstate, "alert: {}", line.text());
                self.raise(line.text().to_string(), now)
            }
        }
    }

    fn raise(&mut self, text: String, now: Instant) -> Result<(), MonitorError> {
        self.buffer.push(text);
        self.limiter.record_fired(1);
        if let Some(count) = self.burst.record(now) {
            self.flush()?;
            let minutes = self.burst.cooldown().as_secs() / 60;
            warn!(count, minutes, "alert burst, pausing log processing");
            let notice = format!(
                "{}  too many alerts ({count}) in short interim. Sleeping for {minutes} minutes...",
                self.stamp()
            );
            self.deliver(&notice)?;
        }
        Ok(())
    }

    fn run_health(&mut self, now: Instant) -> Result<(), MonitorError> {
        self.next_health = now + self.config.health_cooldown();
        if self.health.is_empty() {
            return Ok(());
        }
        let stamp = self.stamp();
        let alerts = self.health.run(&self.config, &mut self.limiter, now, stamp);
        if self.config.run.suspended {
            if !alerts.is_empty() {
                debug!(count = alerts.len(), "suspended, health alerts discarded");
            }
            return Ok(());
        }
        for text in alerts {
            self.raise(text, now)?;
        }
        Ok(())
    }

    fn refresh(&mut self, now: Instant) -> Result<(), MonitorError> {
        self.last_refresh = now;
        self.reload_config();
        if self.source.refresh(self.clock.wall())? {
            info!("following rotated log file");
        }
        Ok(())
    }

    fn reload_config(&mut self) {
        match self.config_source.reload(&self.config) {
            Ok(fresh) => self.apply_config(fresh),
            Err(e) => warn!(error = %e, "config refresh failed, keeping previous settings"),
        }
    }

    fn apply_config(&mut self, fresh: Config) {
        if let Err(e) = self.classifier.update_filters(&fresh.filters) {
            warn!(error = %e, "refreshed filters rejected, keeping previous settings");
            return;
        }
        if fresh.run.suspended != self.config.run.suspended {
            info!(suspended = fresh.run.suspended, "alerting suspension changed");
        }
        self.limiter
            .reconfigure(fresh.run.rate_limit_scope, fresh.run.max_alerts);
        self.config = fresh;
        debug!(
            max_alerts = self.config.run.max_alerts,
            check_interval = self.config.run.check_interval,
            suspended = self.config.run.suspended,
            filters = ?self.config.filters,
            thresholds = ?self.config.thresholds,
            "configuration refreshed"
        );
    }

    /// Reads and discards lines so nothing queued during suspension alerts
    /// on resume, then sleeps and re-reads the suspension flag.
    fn idle_suspended(&mut self) -> Result<(), MonitorError> {
        let mut skipped = 0usize;
        loop {
            match self.source.next_line() {
                Ok(Some(_)) => skipped += 1,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "reading log source failed while suspended");
                    break;
                }
            }
        }
        if skipped > 0 {
            debug!(skipped, "suspended, log lines discarded");
        }
        self.flush()?;
        let nap = SUSPENDED_POLL.min(self.deadline.saturating_duration_since(self.clock.now()));
        self.clock.sleep(nap);
        self.reload_config();
        Ok(())
    }

    fn stop_on_budget(&mut self) -> Result<(), MonitorError> {
        self.flush()?;
        let max = self.limiter.max_alerts();
        warn!(max, total = self.limiter.total_fired(), "max alerts exceeded, stopping");
        let notice = format!(
            "{}  Max Alerts ({max}) exceeded. Program terminating prematurely.",
            self.stamp()
        );
        self.deliver(&notice)
    }

    fn flush(&mut self) -> Result<(), MonitorError> {
        let Some(body) = self.buffer.take() else {
            return Ok(());
        };
        let lines = body.lines().count();
        self.deliver(&body)?;
        info!(
            lines,
            total = self.limiter.total_fired(),
            "ALERT({}) SENT",
            self.limiter.total_fired()
        );
        Ok(())
    }

    fn deliver(&mut self, body: &str) -> Result<(), MonitorError> {
        let subject = self.config.subject();
        self.notifier.deliver(&subject, body)?;
        Ok(())
    }

    fn shutdown(&mut self, outcome: &RunOutcome) {
        if let Err(e) = self.flush() {
            error!(error = %e, "could not deliver pending alerts");
        }
        if let RunOutcome::Failed(reason) = outcome {
            let notice = format!("{}  {} terminating: {reason}", self.stamp(), self.config.subject());
            if let Err(e) = self.deliver(&notice) {
                error!(error = %e, "could not deliver termination notice");
            }
        }
        self.source.close();
        info!(
            alerts = self.limiter.total_fired(),
            exit_code = outcome.exit_code(),
            "monitoring ending, {} alert(s) detected",
            self.limiter.total_fired()
        );
    }
}

/// End of a run of `minutes` starting at `now`. Spans too long for the
/// clock are clamped.
fn run_deadline(now: Instant, minutes: u64) -> Instant {
    let span = Duration::from_secs(minutes.saturating_mul(60));
    now.checked_add(span)
        .or_else(|| now.checked_add(Duration::from_secs(u64::from(u32::MAX))))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::health::{CheckContext, HealthError, HealthProbe};
    use crate::limiter::AlertCategory;
    use chrono::NaiveDateTime;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Sent = Arc<Mutex<Vec<String>>>;

    struct Recorder(Sent);

    impl Notifier for Recorder {
        fn deliver(&mut self, _subject: &str, body: &str) -> Result<(), DeliveryError> {
            self.0.lock().unwrap().push(body.to_string());
            Ok(())
        }
    }

    struct Lines(VecDeque<String>, Arc<Mutex<bool>>);

    impl LineSource for Lines {
        fn next_line(&mut self) -> Result<Option<String>, SourceError> {
            Ok(self.0.pop_front())
        }

        fn refresh(&mut self, _now: NaiveDateTime) -> Result<bool, SourceError> {
            Ok(false)
        }

        fn close(&mut self) {
            *self.1.lock().unwrap() = true;
        }
    }

    struct Unchanged;

    impl ConfigSource for Unchanged {
        fn reload(&mut self, current: &Config) -> Result<Config, ConfigError> {
            Ok(current.clone())
        }
    }

    struct AlwaysHot;

    impl HealthProbe for AlwaysHot {
        fn name(&self) -> &'static str {
            "hot"
        }

        fn check(&mut self, ctx: &mut CheckContext<'_>) -> Result<(), HealthError> {
            ctx.raise(AlertCategory::Load, "load high");
            Ok(())
        }
    }

    fn wall() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2024-03-01 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn monitor(
        config: Config,
        lines: &[&str],
        health: HealthSuite,
    ) -> (Monitor, Sent, Arc<Mutex<bool>>) {
        let sent = Sent::default();
        let closed = Arc::new(Mutex::new(false));
        let parts = MonitorParts {
            source: Box::new(Lines(
                lines.iter().map(|l| l.to_string()).collect(),
                closed.clone(),
            )),
            notifier: Box::new(Recorder(sent.clone())),
            health,
            config_source: Box::new(Unchanged),
            clock: Box::new(ManualClock::new(wall())),
        };
        let classifier = LineClassifier::new(&config.filters, None).unwrap();
        let monitor = Monitor::new(config, classifier, parts, Arc::new(AtomicBool::new(false)));
        (monitor, sent, closed)
    }

    fn config(minutes: u64) -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::tests::sample_config(dir.path());
        config.run.minutes = minutes;
        (dir, config)
    }

    #[test]
    fn test_completes_after_deadline_and_closes_source() {
        let (_dir, config) = config(1);
        let (mut monitor, sent, closed) = monitor(config, &[], HealthSuite::new());
        let outcome = monitor.run();
        assert!(matches!(outcome, RunOutcome::Completed));
        assert_eq!(outcome.exit_code(), EXIT_OK);
        assert!(sent.lock().unwrap().is_empty());
        assert!(*closed.lock().unwrap());
    }

    #[test]
    fn test_interrupt_is_observed() {
        let (_dir, config) = config(10);
        let (mut monitor, _, closed) = monitor(config, &[], HealthSuite::new());
        monitor.interrupt.store(true, Ordering::SeqCst);
        let outcome = monitor.run();
        assert_eq!(outcome.exit_code(), EXIT_INTERRUPTED);
        assert!(*closed.lock().unwrap());
    }

    #[test]
    fn test_deadline_of_huge_run_does_not_overflow() {
        let now = Instant::now();
        assert_eq!(run_deadline(now, 2), now + Duration::from_secs(120));
        assert!(run_deadline(now, u64::MAX) > now);

        let (_dir, mut config) = config(1);
        config.run.minutes = u64::MAX;
        let (mut monitor, _, _) = monitor(config, &[], HealthSuite::new());
        monitor.interrupt.store(true, Ordering::SeqCst);
        assert_eq!(monitor.run().exit_code(), EXIT_INTERRUPTED);
    }

    #[test]
    fn test_alerts_batched_until_source_catches_up() {
        let (_dir, config) = config(1);
        let lines = [
            "2024-03-01 10:00:01 UTC [1] ERROR:  one",
            "2024-03-01 10:00:02 UTC [1] LOG:  not matched by grep",
            "2024-03-01 10:00:03 UTC [1] FATAL:  two",
        ];
        let (mut monitor, sent, _) = monitor(config, &lines, HealthSuite::new());
        monitor.run();
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            "2024-03-01 10:00:01 UTC [1] ERROR:  one\n2024-03-01 10:00:03 UTC [1] FATAL:  two"
        );
        assert_eq!(monitor.total_fired(), 2);
    }

    #[test]
    fn test_max_alerts_stops_run() {
        let (_dir, mut config) = config(10);
        config.run.max_alerts = 2;
        let lines = [
            "2024-03-01 10:00:01 UTC [1] ERROR:  one",
            "2024-03-01 10:00:02 UTC [1] ERROR:  two",
            "2024-03-01 10:00:03 UTC [1] ERROR:  three",
            "2024-03-01 10:00:04 UTC [1] ERROR:  four",
        ];
        let (mut monitor, sent, _) = monitor(config, &lines, HealthSuite::new());
        let outcome = monitor.run();
        assert!(matches!(outcome, RunOutcome::MaxAlertsExceeded));
        assert_eq!(outcome.exit_code(), EXIT_OK);

        let sent = sent.lock().unwrap();
        assert!(sent[0].contains("three"));
        assert!(!sent[0].contains("four"));
        assert!(sent[1].ends_with("Max Alerts (2) exceeded. Program terminating prematurely."));
    }

    #[test]
    fn test_health_alerts_respect_cooldown() {
        let (_dir, config) = config(16);
        let mut health = HealthSuite::new();
        health.push(Box::new(AlwaysHot));
        let (mut monitor, sent, _) = monitor(config, &[], health);
        monitor.run();

        // checks every 300s for 16 minutes: cooldown lets every other one through
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|s| s.ends_with("load high")));
        assert_eq!(sent[0], "2024-03-01 10:00:00  load high");
    }

    #[test]
    fn test_suspended_discards_everything() {
        let (_dir, mut config) = config(5);
        config.run.suspended = true;
        let mut health = HealthSuite::new();
        health.push(Box::new(AlwaysHot));
        let (mut monitor, sent, _) =
            monitor(config, &["2024-03-01 10:00:01 UTC [1] ERROR:  one"], health);
        let outcome = monitor.run();
        assert!(matches!(outcome, RunOutcome::Completed));
        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(monitor.total_fired(), 0);
    }
}
