//! End-to-end runs of the monitor against real log files under a temp dir,
//! with a clock that fires file edits at chosen points of the run.

use super::*;
use crate::classifier::SqlStateRule;
use crate::config::ConfigError;
use crate::health::HostHealth;
use crate::procfs::MockFs;
use crate::source::{LogSourceTracker, TemplateResolver};
use chrono::NaiveDateTime;
use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const TEMPLATE: &str = "postgresql-%Y-%m-%d_%H.log";

type Action = Box<dyn FnOnce()>;

struct ScriptedClock {
    inner: ManualClock,
    events: RefCell<Vec<(Duration, Action)>>,
}

impl ScriptedClock {
    fn new(wall: &str) -> Self {
        Self {
            inner: ManualClock::new(NaiveDateTime::parse_from_str(wall, STAMP_FORMAT).unwrap()),
            events: RefCell::new(Vec::new()),
        }
    }

    fn at(self, secs: u64, action: impl FnOnce() + 'static) -> Self {
        self.events
            .borrow_mut()
            .push((Duration::from_secs(secs), Box::new(action)));
        self
    }
}

impl Clock for ScriptedClock {
    fn now(&self) -> Instant {
        self.inner.now()
    }

    fn wall(&self) -> NaiveDateTime {
        self.inner.wall()
    }

    fn sleep(&self, duration: Duration) {
        self.inner.advance(duration);
        let elapsed = self.inner.elapsed();
        let mut events = self.events.borrow_mut();
        while let Some(pos) = events.iter().position(|(at, _)| *at <= elapsed) {
            let (_, action) = events.remove(pos);
            action();
        }
    }
}

type Sent = Arc<Mutex<Vec<String>>>;

struct Recorder(Sent);

impl Notifier for Recorder {
    fn deliver(&mut self, _subject: &str, body: &str) -> Result<(), DeliveryError> {
        self.0.lock().unwrap().push(body.to_string());
        Ok(())
    }
}

struct Unchanged;

impl ConfigSource for Unchanged {
    fn reload(&mut self, current: &Config) -> Result<Config, ConfigError> {
        Ok(current.clone())
    }
}

struct Run {
    outcome: RunOutcome,
    total: u64,
    sent: Vec<String>,
}

impl Run {
    fn delivered_lines(&self) -> Vec<String> {
        self.sent
            .iter()
            .flat_map(|body| body.lines().map(str::to_string))
            .collect()
    }

    fn count_containing(&self, needle: &str) -> usize {
        self.delivered_lines().iter().filter(|l| l.contains(needle)).count()
    }
}

fn append(path: &Path, text: &str) {
    let mut f = fs::OpenOptions::new().append(true).create(true).open(path).unwrap();
    f.write_all(text.as_bytes()).unwrap();
}

fn log_path(dir: &Path, hour: u32) -> PathBuf {
    dir.join(format!("postgresql-2024-03-01_{hour:02}.log"))
}

fn config(dir: &Path, minutes: u64) -> Config {
    let mut config = crate::config::tests::sample_config(dir);
    config.run.minutes = minutes;
    config
}

fn run(
    config: Config,
    classifier: LineClassifier,
    dir: &Path,
    health: HealthSuite,
    clock: ScriptedClock,
) -> Run {
    let resolver = TemplateResolver::new(dir.to_path_buf(), TEMPLATE.to_string()).unwrap();
    let mut tracker = LogSourceTracker::new(Box::new(resolver)).with_retry_delay(Duration::ZERO);
    tracker.open(clock.wall(), true).unwrap();

    let sent = Sent::default();
    let parts = MonitorParts {
        source: Box::new(tracker),
        notifier: Box::new(Recorder(sent.clone())),
        health,
        config_source: Box::new(Unchanged),
        clock: Box::new(clock),
    };
    let mut monitor = Monitor::new(config, classifier, parts, Arc::new(AtomicBool::new(false)));
    let outcome = monitor.run();
    let total = monitor.total_fired();
    let sent = sent.lock().unwrap().clone();
    Run { outcome, total, sent }
}

fn plain_classifier(config: &Config) -> LineClassifier {
    LineClassifier::new(&config.filters, None).unwrap()
}

#[test]
fn test_deadlock_is_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        log_path(dir.path(), 10),
        "2024-03-01 10:00:01 UTC [31] ERROR:  deadlock detected\n\
         2024-03-01 10:00:01 UTC [31] DETAIL:  Process 31 waits for ShareLock on transaction 77\n",
    )
    .unwrap();
    let config = config(dir.path(), 2);
    let classifier = plain_classifier(&config);

    let run = run(config, classifier, dir.path(), HealthSuite::new(), ScriptedClock::new("2024-03-01 10:05:00"));
    assert!(matches!(run.outcome, RunOutcome::Completed));
    assert_eq!(run.total, 1);
    assert_eq!(run.sent, vec!["2024-03-01 10:00:01 UTC [31] ERROR:  deadlock detected".to_string()]);
}

#[test]
fn test_lock_waits_below_threshold_are_suppressed() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        log_path(dir.path(), 10),
        "2024-03-01 10:00:01 UTC [9] LOG:  process 9 still waiting for ShareLock on transaction 77 after 500.2 ms\n\
         2024-03-01 10:00:02 UTC [9] LOG:  process 9 still waiting for ShareLock on transaction 78 after 1500.2 ms\n",
    )
    .unwrap();
    let mut config = config(dir.path(), 1);
    config.filters.grep = "ERROR:|FATAL:|still waiting for".to_string();
    let classifier = plain_classifier(&config);

    let run = run(config, classifier, dir.path(), HealthSuite::new(), ScriptedClock::new("2024-03-01 10:05:00"));
    assert_eq!(run.total, 1);
    assert_eq!(run.count_containing("after 500.2 ms"), 0);
    assert_eq!(run.count_containing("after 1500.2 ms"), 1);
}

#[test]
fn test_invalid_and_denied_lines_never_alert() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        log_path(dir.path(), 10),
        "garbage ERROR:  no timestamp here\n\
         2024-03-01 10:00:01 UTC [1] <53100> FATAL:  could not write to file: No space left on device\n\
         2024-03-01 10:00:02 UTC [1] <42P01> ERROR:  relation \"t\" does not exist\n",
    )
    .unwrap();
    let mut config = config(dir.path(), 1);
    config.filters.sqlclass = vec!["53".to_string()];
    let rule = SqlStateRule::from_log_line_prefix("%t [%p] <%e> ").unwrap();
    let classifier = LineClassifier::new(&config.filters, Some(rule)).unwrap();

    let run = run(config, classifier, dir.path(), HealthSuite::new(), ScriptedClock::new("2024-03-01 10:05:00"));
    assert_eq!(run.total, 1);
    assert_eq!(run.count_containing("no timestamp"), 0);
    assert_eq!(run.count_containing("<53100>"), 0);
    assert_eq!(run.count_containing("<42P01>"), 1);
}

#[test]
fn test_rotation_rescan_does_not_redeliver() {
    let dir = tempfile::tempdir().unwrap();
    let first = log_path(dir.path(), 10);
    let second = log_path(dir.path(), 11);
    fs::write(
        &first,
        "2024-03-01 10:45:00 UTC [1] ERROR:  first\n2024-03-01 10:46:00 UTC [1] ERROR:  second\n",
    )
    .unwrap();

    let appended = first.clone();
    let clock = ScriptedClock::new("2024-03-01 10:50:00")
        .at(300, move || append(&appended, "2024-03-01 10:55:00 UTC [1] ERROR:  third\n"))
        .at(720, move || {
            // the new file repeats the last line of the old one
            fs::write(
                &second,
                "2024-03-01 10:55:00 UTC [1] ERROR:  third\n2024-03-01 11:01:00 UTC [1] ERROR:  fourth\n",
            )
            .unwrap();
        });

    let config = config(dir.path(), 30);
    let classifier = plain_classifier(&config);
    let run = run(config, classifier, dir.path(), HealthSuite::new(), clock);

    assert!(matches!(run.outcome, RunOutcome::Completed));
    assert_eq!(run.total, 4);
    for word in ["first", "second", "third", "fourth"] {
        assert_eq!(run.count_containing(&format!("ERROR:  {word}")), 1, "{word}");
    }
}

#[test]
fn test_rewritten_file_is_not_redelivered() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(dir.path(), 10);
    let content = "2024-03-01 10:00:01 UTC [1] ERROR:  one\n2024-03-01 10:00:02 UTC [1] ERROR:  two\n";
    fs::write(&path, content).unwrap();

    let staged = dir.path().join("staged.tmp");
    let target = path.clone();
    let clock = ScriptedClock::new("2024-03-01 10:05:00").at(30, move || {
        fs::write(&staged, content).unwrap();
        fs::rename(&staged, &target).unwrap();
    });

    let config = config(dir.path(), 1);
    let classifier = plain_classifier(&config);
    let run = run(config, classifier, dir.path(), HealthSuite::new(), clock);
    assert_eq!(run.total, 2);
    assert_eq!(run.sent.len(), 1);
}

#[test]
fn test_burst_pauses_lines_but_not_health() {
    let dir = tempfile::tempdir().unwrap();
    let lines: String = (0..30)
        .map(|n| format!("2024-03-01 10:00:{n:02} UTC [1] ERROR:  failure {n}\n"))
        .collect();
    fs::write(log_path(dir.path(), 10), lines).unwrap();

    let mut config = config(dir.path(), 10);
    config.run.check_interval = 60;
    let classifier = plain_classifier(&config);
    let mut health = HealthSuite::new();
    health.push(Box::new(HostHealth::new(MockFs::with_host(16.0, 2), "/proc")));

    let run = run(config, classifier, dir.path(), health, ScriptedClock::new("2024-03-01 10:05:00"));

    assert!(matches!(run.outcome, RunOutcome::Completed));
    assert_eq!(run.count_containing("too many alerts"), 1);
    assert_eq!(run.count_containing("failure 29"), 0);
    // checks every 60s, each category at most once per 60s: 0, 120, 240, ...
    assert_eq!(run.count_containing("Current load (16.00)"), 5);
}

#[test]
fn test_rotation_during_burst_pause_keeps_queued_lines() {
    let dir = tempfile::tempdir().unwrap();
    let lines: String = (0..30)
        .map(|n| format!("2024-03-01 10:50:{n:02} UTC [1] ERROR:  failure {n}\n"))
        .collect();
    fs::write(log_path(dir.path(), 10), lines).unwrap();
    fs::write(
        log_path(dir.path(), 11),
        "2024-03-01 11:00:01 UTC [1] ERROR:  next hour 1\n2024-03-01 11:00:02 UTC [1] ERROR:  next hour 2\n",
    )
    .unwrap();

    // the pause runs 0..600s, the 11:00 rotation is picked up at 300s
    let mut config = config(dir.path(), 20);
    config.run.refresh_rate = 5;
    let classifier = plain_classifier(&config);
    let run = run(config, classifier, dir.path(), HealthSuite::new(), ScriptedClock::new("2024-03-01 10:55:00"));

    assert!(matches!(run.outcome, RunOutcome::Completed));
    assert_eq!(run.count_containing("too many alerts"), 1);
    assert_eq!(run.total, 32);
    let delivered = run.delivered_lines();
    for n in 0..30 {
        let needle = format!("ERROR:  failure {n}");
        assert_eq!(delivered.iter().filter(|l| l.ends_with(&needle)).count(), 1, "{needle}");
    }
    assert_eq!(run.count_containing("next hour"), 2);
}

#[test]
fn test_max_alerts_ends_run_with_notice() {
    let dir = tempfile::tempdir().unwrap();
    let lines: String = (0..8)
        .map(|n| format!("2024-03-01 10:00:{n:02} UTC [1] ERROR:  failure {n}\n"))
        .collect();
    fs::write(log_path(dir.path(), 10), lines).unwrap();

    let mut config = config(dir.path(), 10);
    config.run.max_alerts = 5;
    let classifier = plain_classifier(&config);

    let run = run(config, classifier, dir.path(), HealthSuite::new(), ScriptedClock::new("2024-03-01 10:05:00"));
    assert!(matches!(run.outcome, RunOutcome::MaxAlertsExceeded));
    assert_eq!(run.total, 6);
    assert_eq!(run.count_containing("Max Alerts (5) exceeded"), 1);
    assert_eq!(run.count_containing("failure 6"), 0);
}
