//! pgalert-core: PostgreSQL log monitoring and alerting library.
//!
//! Provides:
//! - `config`: TOML configuration snapshot, validation, hot reload
//! - `classifier`: per-line alert/suppress decisions (sqlstate, lock waits, deadlocks)
//! - `watermark`: re-delivery guard for re-scanned log tails
//! - `limiter`: per-category cooldowns, run alert budget, burst guard
//! - `buffer`: alert accumulation between dispatch points
//! - `source`: log file identity, rotation and tailing (local file or RDS download)
//! - `monitor`: the polling loop that composes all of the above
//! - `notify`: notification transports (SMTP, sendmail, log-only)
//! - `health`: host and database health checks
//! - `procfs`: `/proc` access behind a mockable filesystem trait
//! - `pg`: PostgreSQL connection and server settings discovery
//! - `exec`: external command execution with timeouts
//! - `lock`: single-instance run lock
//! - `history`: pruning of old history logs

pub mod buffer;
pub mod classifier;
pub mod config;
pub mod exec;
pub mod health;
pub mod history;
pub mod limiter;
pub mod lock;
pub mod monitor;
pub mod notify;
pub mod pg;
pub mod procfs;
pub mod source;
pub mod watermark;

/// Name used for the run lock and in notification subjects.
pub const PROCESS_NAME: &str = "pgalert";
