//! Log source: which file is current, and the lines appended to it.
//!
//! A [`LogResolver`] names the current log file (expanding a filename
//! template, asking the server, or listing RDS log files) and makes it
//! readable locally. [`LogSourceTracker`] follows it across rotations.

mod local;
mod rds;
mod tailer;

pub use local::{CurrentLogfileResolver, TemplateResolver, expand_template};
pub use rds::RdsResolver;
pub use tailer::FileTailer;

use crate::config::{Config, SourceKind};
use crate::exec::{CommandError, SystemRunner};
use crate::monitor::{Clock, SystemClock};
use crate::pg::ServerSettings;
use chrono::NaiveDateTime;
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Resolution attempts before the source is declared lost.
pub const RESOLVE_ATTEMPTS: u32 = 3;
pub const RESOLVE_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("log file {0} does not exist")]
    Missing(PathBuf),
    #[error("no log files found for {0}")]
    NoLogFile(String),
    #[error("invalid log filename template {0:?}")]
    Template(String),
    #[error("log source not configured: {0}")]
    Unconfigured(String),
    #[error("unexpected output from {program}: {reason}")]
    Output { program: String, reason: String },
    #[error("log file lookup query failed: {0}")]
    Query(String),
    #[error("log source unresolvable after {attempts} attempts: {last}")]
    Unresolvable { attempts: u32, last: String },
    #[error("log source is closed")]
    Closed,
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Names one log file. Rotation is a change of `name`; a change of `size`
/// alone means the same file grew.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceIdentity {
    pub name: String,
    pub path: PathBuf,
    pub size: Option<u64>,
}

impl SourceIdentity {
    pub fn same_file(&self, other: &SourceIdentity) -> bool {
        self.name == other.name
    }
}

pub trait LogResolver: Send {
    /// Names the current log file. `attempt` counts retries, and resolvers
    /// that look files up by time search further back on later attempts.
    fn resolve(&mut self, now: NaiveDateTime, attempt: u32) -> Result<SourceIdentity, SourceError>;

    /// Makes the file readable locally; returns the path to tail.
    fn materialize(&mut self, identity: &SourceIdentity) -> Result<PathBuf, SourceError>;

    /// Releases local copies on shutdown.
    fn release(&mut self) {}
}

/// What the monitor needs from a log source.
pub trait LineSource {
    fn next_line(&mut self) -> Result<Option<String>, SourceError>;

    /// Re-resolves the current file. Returns true when it rotated.
    fn refresh(&mut self, now: NaiveDateTime) -> Result<bool, SourceError>;

    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Resolving,
    Streaming,
    Rotating,
    Closed,
}

pub struct LogSourceTracker {
    resolver: Box<dyn LogResolver>,
    state: SourceState,
    identity: Option<SourceIdentity>,
    tailer: Option<FileTailer>,
    pending: VecDeque<String>,
    retry_delay: Duration,
    interrupt: Option<Arc<AtomicBool>>,
}

impl LogSourceTracker {
    pub fn new(resolver: Box<dyn LogResolver>) -> Self {
        Self {
            resolver,
            state: SourceState::Resolving,
            identity: None,
            tailer: None,
            pending: VecDeque::new(),
            retry_delay: RESOLVE_RETRY_DELAY,
            interrupt: None,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Waits between resolve attempts end early, and retries stop, once
    /// `flag` is set.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn identity(&self) -> Option<&SourceIdentity> {
        self.identity.as_ref()
    }

    /// Resolves and opens the current file. With `initial_scan` the file is
    /// read from the beginning, otherwise only lines appended from now on.
    pub fn open(&mut self, now: NaiveDateTime, initial_scan: bool) -> Result<(), SourceError> {
        self.state = SourceState::Resolving;
        let identity = self.resolve_with_retry(now)?;
        let path = self.resolver.materialize(&identity)?;
        let tailer = if initial_scan {
            FileTailer::from_start(path)?
        } else {
            FileTailer::new(path)?
        };
        info!(
            file = %identity.name,
            path = %tailer.path().display(),
            initial_scan,
            "monitoring log file"
        );
        self.tailer = Some(tailer);
        self.identity = Some(identity);
        self.state = SourceState::Streaming;
        Ok(())
    }

    fn resolve_with_retry(&mut self, now: NaiveDateTime) -> Result<SourceIdentity, SourceError> {
        let mut last = None;
        let mut attempts = 0;
        while attempts < RESOLVE_ATTEMPTS {
            let attempt = attempts;
            attempts += 1;
            match self.resolver.resolve(now, attempt) {
                Ok(identity) => return Ok(identity),
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "could not resolve current log file");
                    last = Some(e);
                    if attempts < RESOLVE_ATTEMPTS && !self.retry_delay.is_zero() {
                        let sleeper = match &self.interrupt {
                            Some(flag) => SystemClock::interruptible(flag.clone()),
                            None => SystemClock::new(),
                        };
                        sleeper.sleep(self.retry_delay);
                    }
                    if self.interrupted() {
                        info!(attempts, "interrupted, giving up on log file resolution");
                        break;
                    }
                }
            }
        }
        Err(SourceError::Unresolvable {
            attempts,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    fn rotate(&mut self, next: SourceIdentity) -> Result<(), SourceError> {
        self.state = SourceState::Rotating;
        info!(
            from = self.identity.as_ref().map(|i| i.name.as_str()).unwrap_or("-"),
            to = %next.name,
            "log file rotated"
        );
        // lines still in the old file must be handed out before the new one
        if let Some(tailer) = self.tailer.as_mut() {
            loop {
                match tailer.read_new_lines() {
                    Ok(lines) if lines.is_empty() => break,
                    Ok(lines) => self.pending.extend(lines),
                    Err(e) => {
                        warn!(path = %tailer.path().display(), error = %e, "could not finish reading rotated log file");
                        break;
                    }
                }
            }
        }
        let path = self.resolver.materialize(&next)?;
        match self.tailer.as_mut() {
            Some(tailer) => tailer.rewind(path)?,
            None => self.tailer = Some(FileTailer::from_start(path)?),
        }
        self.identity = Some(next);
        self.state = SourceState::Streaming;
        Ok(())
    }
}

impl LineSource for LogSourceTracker {
    fn next_line(&mut self) -> Result<Option<String>, SourceError> {
        if self.state == SourceState::Closed {
            return Err(SourceError::Closed);
        }
        if let Some(line) = self.pending.pop_front() {
            return Ok(Some(line));
        }
        let tailer = self.tailer.as_mut().ok_or(SourceError::Closed)?;
        self.pending.extend(tailer.read_new_lines()?);
        Ok(self.pending.pop_front())
    }

    fn refresh(&mut self, now: NaiveDateTime) -> Result<bool, SourceError> {
        if self.state == SourceState::Closed {
            return Err(SourceError::Closed);
        }
        let next = self.resolve_with_retry(now)?;
        let Some(current) = self.identity.clone() else {
            self.rotate(next)?;
            return Ok(true);
        };
        if !current.same_file(&next) {
            self.rotate(next)?;
            return Ok(true);
        }
        if current.size != next.size {
            debug!(file = %next.name, size = ?next.size, "log file grew, refreshing local copy");
            self.resolver.materialize(&next)?;
            self.identity = Some(next);
        }
        Ok(false)
    }

    fn close(&mut self) {
        if self.state == SourceState::Closed {
            return;
        }
        self.state = SourceState::Closed;
        self.tailer = None;
        self.pending.clear();
        self.resolver.release();
        debug!("log source closed");
    }
}

/// Picks the resolver for the configured source kind.
///
/// `settings` are the values discovered from the server; explicit config
/// values win over them.
pub fn resolver_from_config(
    config: &Config,
    settings: Option<&ServerSettings>,
) -> Result<Box<dyn LogResolver>, SourceError> {
    let source = &config.source;
    match source.kind {
        SourceKind::Rds => {
            let resolver = RdsResolver::from_settings(SystemRunner, source, &config.run.alertlog_directory)?;
            Ok(Box::new(resolver))
        }
        SourceKind::Local if source.use_current_logfile => {
            let settings = settings.ok_or_else(|| {
                SourceError::Unconfigured("use_current_logfile needs a database connection".into())
            })?;
            let resolver = CurrentLogfileResolver::connect(
                &config.database,
                settings.data_directory.clone(),
            )?;
            Ok(Box::new(resolver))
        }
        SourceKind::Local => {
            let directory = source
                .pglog_directory
                .clone()
                .or_else(|| settings.map(ServerSettings::log_directory_path))
                .ok_or_else(|| SourceError::Unconfigured("no log directory known".into()))?;
            let template = source
                .log_filename
                .clone()
                .or_else(|| settings.map(|s| s.log_filename.clone()))
                .ok_or_else(|| SourceError::Unconfigured("no log filename template known".into()))?;
            Ok(Box::new(TemplateResolver::new(directory, template)?))
        }
    }
}
