//! Configuration snapshot loaded from a TOML file.
//!
//! A `Config` is immutable once validated. Refreshes build a new snapshot
//! (see [`ConfigSource`]) which the monitor swaps in wholesale.

mod refresh;

pub use refresh::{CliOverrides, ConfigSource, FileConfigSource};

use crate::classifier::GrepFilter;
use crate::limiter::RateLimitScope;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 300;
pub const MIN_CHECK_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_REFRESH_MINUTES: u64 = 15;
pub const DEFAULT_MAX_ALERTS: u64 = 100;
/// Longest accepted run, one leap year.
pub const MAX_RUN_MINUTES: u64 = 366 * 24 * 60;
pub const DEFAULT_LOAD_PCT: u32 = 100;
pub const DEFAULT_DIRECTORY_PCT: u32 = 99;
pub const DEFAULT_SECONDS_THRESHOLD: u64 = 9999;
pub const DEFAULT_TEMP_BYTES: u64 = 999_999_999_999;
pub const MIN_TEMP_BYTES: u64 = 100_000;
pub const DEFAULT_CONNECTION_PCT: u32 = 90;
pub const DEFAULT_GREP: &str = "ERROR:|FATAL:|PANIC:";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub run: RunSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    pub notify: NotifySettings,
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default)]
    pub filters: FilterRules,
    #[serde(default)]
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunSettings {
    pub clusterid: String,
    /// Total run length. Zero is rejected unless overridden on the command line.
    #[serde(default)]
    pub minutes: u64,
    pub alertlog_directory: PathBuf,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default = "default_max_alerts")]
    pub max_alerts: u64,
    /// Health check cadence, seconds.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    /// Config and log source refresh cadence, minutes.
    #[serde(default = "default_refresh_rate")]
    pub refresh_rate: u64,
    #[serde(default)]
    pub keeplogdays: Option<u32>,
    #[serde(default)]
    pub rate_limit_scope: RateLimitScope,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslMode {
    #[default]
    Disable,
    Require,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub dbname: String,
    pub user: String,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub sslmode: SslMode,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            dbname: String::new(),
            user: String::new(),
            host: String::new(),
            port: 5432,
            password: None,
            sslmode: SslMode::Disable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailMethod {
    Smtp,
    Sendmail,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    /// Comma-separated recipients.
    pub to: String,
    pub from: Option<String>,
    pub emailalerts: bool,
    pub method: Option<MailMethod>,
    pub smtp_server: String,
    pub smtp_port: Option<u16>,
    pub smtp_account: String,
    pub smtp_password: String,
    pub sendmail_command: Option<String>,
    pub sms: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Local,
    Rds,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub kind: SourceKind,
    /// Overrides the server's `log_directory`.
    pub pglog_directory: Option<PathBuf>,
    /// strftime template, overrides the server's `log_filename`.
    pub log_filename: Option<String>,
    /// Ask the server for `pg_current_logfile()` instead of expanding a template.
    pub use_current_logfile: bool,
    pub initial_scan: Option<bool>,
    pub rds_instance: Option<String>,
    pub rds_region: Option<String>,
    pub aws_cli: String,
    /// Seconds before an external command is killed.
    pub command_timeout: u64,
    pub spool_directory: Option<PathBuf>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            kind: SourceKind::Local,
            pglog_directory: None,
            log_filename: None,
            use_current_logfile: false,
            initial_scan: None,
            rds_instance: None,
            rds_region: None,
            aws_cli: "aws".to_string(),
            command_timeout: 120,
            spool_directory: None,
        }
    }
}

impl SourceSettings {
    /// Whether to read the whole current file on open. Downloads always
    /// start from the beginning unless told otherwise.
    pub fn initial_scan(&self) -> bool {
        self.initial_scan
            .unwrap_or(matches!(self.kind, SourceKind::Rds))
    }
}

/// Line filtering rules. Reloadable.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FilterRules {
    /// Include regex applied before classification. `\|` is accepted as `|`.
    pub grep: String,
    pub grep_exclude: Option<String>,
    /// Lock wait threshold, seconds.
    pub lockwait: u64,
    /// Substring that suppresses lock wait lines outright. Empty never matches.
    pub lockfilter: Option<String>,
    /// Exact sqlstates never alerted on.
    pub sqlstate: Vec<String>,
    /// Sqlstate class prefixes never alerted on.
    pub sqlclass: Vec<String>,
    pub ignore_apps: Vec<String>,
    pub ignore_users: Vec<String>,
    pub ignore_queries: Vec<String>,
    pub alert_stmt_timeout: bool,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self {
            grep: DEFAULT_GREP.to_string(),
            grep_exclude: None,
            lockwait: 1,
            lockfilter: None,
            sqlstate: Vec::new(),
            sqlclass: Vec::new(),
            ignore_apps: Vec::new(),
            ignore_users: Vec::new(),
            ignore_queries: Vec::new(),
            alert_stmt_timeout: false,
        }
    }
}

/// Health check thresholds. Reloadable.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Percent of CPU count.
    pub load: u32,
    /// Percent of filesystem used.
    pub directory: u32,
    /// Seconds.
    pub idle_transaction: u64,
    /// Seconds.
    pub long_query: u64,
    /// Bytes under `base/pgsql_tmp`; unset disables the check.
    pub pgsql_tmp: Option<u64>,
    /// Bytes of temp files written between two checks.
    pub temp_bytes: u64,
    /// Percent of `max_connections`.
    pub connection_pct: u32,
    /// Expected replica addresses.
    pub slaves: Vec<String>,
    pub monitor_lag: bool,
    pub ignore_autovac_daemon: bool,
    pub ignore_user_vacuum: bool,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            load: DEFAULT_LOAD_PCT,
            directory: DEFAULT_DIRECTORY_PCT,
            idle_transaction: DEFAULT_SECONDS_THRESHOLD,
            long_query: DEFAULT_SECONDS_THRESHOLD,
            pgsql_tmp: None,
            temp_bytes: DEFAULT_TEMP_BYTES,
            connection_pct: DEFAULT_CONNECTION_PCT,
            slaves: Vec::new(),
            monitor_lag: false,
            ignore_autovac_daemon: true,
            ignore_user_vacuum: true,
        }
    }
}

fn default_max_alerts() -> u64 {
    DEFAULT_MAX_ALERTS
}

fn default_check_interval() -> u64 {
    DEFAULT_CHECK_INTERVAL_SECS
}

fn default_refresh_rate() -> u64 {
    DEFAULT_REFRESH_MINUTES
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

impl Config {
    /// Reads and parses a config file. Call [`Config::validate`] afterwards.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Replaces out-of-range optional values with defaults (with a warning)
    /// and rejects missing or inconsistent required values.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.normalize();

        let run = &self.run;
        if run.clusterid.trim().is_empty() {
            return Err(ConfigError::invalid("run.clusterid", "must not be empty"));
        }
        if run.minutes == 0 {
            return Err(ConfigError::invalid(
                "run.minutes",
                "must be greater than zero",
            ));
        }
        if run.minutes > MAX_RUN_MINUTES {
            return Err(ConfigError::invalid(
                "run.minutes",
                format!("must be at most {MAX_RUN_MINUTES}"),
            ));
        }
        if !run.alertlog_directory.is_dir() {
            return Err(ConfigError::invalid(
                "run.alertlog_directory",
                format!("{} is not a directory", run.alertlog_directory.display()),
            ));
        }

        let db = &self.database;
        for (field, value) in [
            ("database.dbname", &db.dbname),
            ("database.user", &db.user),
            ("database.host", &db.host),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::invalid(field, "must not be empty"));
            }
        }

        self.validate_notify()?;
        self.validate_source()?;
        self.validate_filters()?;
        Ok(())
    }

    fn normalize(&mut self) {
        let run = &mut self.run;
        if run.check_interval < MIN_CHECK_INTERVAL_SECS {
            warn!(
                value = run.check_interval,
                "run.check_interval below {MIN_CHECK_INTERVAL_SECS}s, using {DEFAULT_CHECK_INTERVAL_SECS}s"
            );
            run.check_interval = DEFAULT_CHECK_INTERVAL_SECS;
        }
        if run.refresh_rate == 0 {
            warn!("run.refresh_rate is zero, using {DEFAULT_REFRESH_MINUTES} minutes");
            run.refresh_rate = DEFAULT_REFRESH_MINUTES;
        }

        if self.filters.lockwait == 0 {
            warn!("filters.lockwait is zero, using 1 second");
            self.filters.lockwait = 1;
        }

        let t = &mut self.thresholds;
        if t.load < 10 {
            warn!(value = t.load, "thresholds.load below 10%, using {DEFAULT_LOAD_PCT}%");
            t.load = DEFAULT_LOAD_PCT;
        }
        if t.directory >= 100 {
            warn!(
                value = t.directory,
                "thresholds.directory must be below 100%, using {DEFAULT_DIRECTORY_PCT}%"
            );
            t.directory = DEFAULT_DIRECTORY_PCT;
        }
        if t.idle_transaction <= 1 {
            warn!("thresholds.idle_transaction too small, using {DEFAULT_SECONDS_THRESHOLD}s");
            t.idle_transaction = DEFAULT_SECONDS_THRESHOLD;
        }
        if t.long_query <= 1 {
            warn!("thresholds.long_query too small, using {DEFAULT_SECONDS_THRESHOLD}s");
            t.long_query = DEFAULT_SECONDS_THRESHOLD;
        }
        if t.temp_bytes <= MIN_TEMP_BYTES {
            warn!(value = t.temp_bytes, "thresholds.temp_bytes too small, using default");
            t.temp_bytes = DEFAULT_TEMP_BYTES;
        }
        if t.pgsql_tmp == Some(0) {
            t.pgsql_tmp = None;
        }
        if t.connection_pct == 0 || t.connection_pct > 100 {
            warn!(
                value = t.connection_pct,
                "thresholds.connection_pct out of range, using {DEFAULT_CONNECTION_PCT}%"
            );
            t.connection_pct = DEFAULT_CONNECTION_PCT;
        }
    }

    fn validate_notify(&self) -> Result<(), ConfigError> {
        let notify = &self.notify;
        if notify.to.trim().is_empty() {
            return Err(ConfigError::invalid("notify.to", "must not be empty"));
        }
        if !notify.emailalerts {
            return Ok(());
        }
        match notify.method {
            None => Err(ConfigError::invalid(
                "notify.method",
                "required when emailalerts is on",
            )),
            Some(MailMethod::Smtp) if notify.smtp_server.trim().is_empty() => Err(
                ConfigError::invalid("notify.smtp_server", "required for smtp delivery"),
            ),
            Some(_) => Ok(()),
        }
    }

    fn validate_source(&self) -> Result<(), ConfigError> {
        let source = &self.source;
        if let Some(dir) = &source.pglog_directory
            && !dir.is_dir()
        {
            return Err(ConfigError::invalid(
                "source.pglog_directory",
                format!("{} is not a directory", dir.display()),
            ));
        }
        if source.kind == SourceKind::Rds
            && source
                .rds_instance
                .as_deref()
                .is_none_or(|i| i.trim().is_empty())
        {
            return Err(ConfigError::invalid(
                "source.rds_instance",
                "required for rds sources",
            ));
        }
        if source.command_timeout == 0 {
            return Err(ConfigError::invalid(
                "source.command_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    fn validate_filters(&self) -> Result<(), ConfigError> {
        let filters = &self.filters;
        if let Some(bad) = filters.sqlclass.iter().find(|c| c.contains(char::is_whitespace)) {
            return Err(ConfigError::invalid(
                "filters.sqlclass",
                format!("entry {bad:?} contains whitespace"),
            ));
        }
        if let Some(bad) = filters.sqlstate.iter().find(|c| c.contains(char::is_whitespace)) {
            return Err(ConfigError::invalid(
                "filters.sqlstate",
                format!("entry {bad:?} contains whitespace"),
            ));
        }
        GrepFilter::new(&filters.grep, filters.grep_exclude.as_deref())
            .map_err(|e| ConfigError::invalid("filters.grep", e.to_string()))?;
        Ok(())
    }

    /// Builds the next snapshot from a freshly loaded file. Connection,
    /// source and delivery settings stay as they were at startup.
    pub fn with_reloaded(&self, fresh: Config) -> Config {
        Config {
            run: RunSettings {
                clusterid: self.run.clusterid.clone(),
                minutes: self.run.minutes,
                alertlog_directory: self.run.alertlog_directory.clone(),
                lock_dir: self.run.lock_dir.clone(),
                ..fresh.run
            },
            database: self.database.clone(),
            notify: self.notify.clone(),
            source: self.source.clone(),
            filters: fresh.filters,
            thresholds: fresh.thresholds,
        }
    }

    /// Notification subject line.
    pub fn subject(&self) -> String {
        format!("{} ({})", crate::PROCESS_NAME, self.run.clusterid)
    }

    /// Cooldown applied to each health alert category.
    pub fn health_cooldown(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.run.check_interval)
    }

    pub fn refresh_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.run.refresh_rate * 60)
    }
}
