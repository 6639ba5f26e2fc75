//! RDS instance logs, fetched through the AWS command line client.
//!
//! The newest file is found with `describe-db-log-files` and downloaded in
//! full into a local spool file, which is rewritten in place on every
//! refresh so the tailer keeps its inode.

use super::{LogResolver, SourceError, SourceIdentity};
use crate::config::SourceSettings;
use crate::exec::{CommandRunner, CommandSpec};
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct DescribeLogFiles {
    #[serde(rename = "DescribeDBLogFiles", default)]
    files: Vec<LogFileDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LogFileDetails {
    log_file_name: String,
    last_written: i64,
    #[serde(default)]
    size: u64,
}

pub struct RdsResolver<R: CommandRunner> {
    runner: R,
    aws_cli: String,
    instance: String,
    region: Option<String>,
    timeout: Duration,
    spool: PathBuf,
}

impl<R: CommandRunner> RdsResolver<R> {
    pub fn new(runner: R, aws_cli: String, instance: String, spool: PathBuf) -> Self {
        Self {
            runner,
            aws_cli,
            instance,
            region: None,
            timeout: Duration::from_secs(120),
            spool,
        }
    }

    /// The spool file goes to `spool_directory`, or `default_spool_dir`
    /// when that is unset.
    pub fn from_settings(
        runner: R,
        source: &SourceSettings,
        default_spool_dir: &Path,
    ) -> Result<Self, SourceError> {
        let instance = source
            .rds_instance
            .clone()
            .ok_or_else(|| SourceError::Unconfigured("rds_instance is not set".into()))?;
        let spool_dir = source
            .spool_directory
            .clone()
            .unwrap_or_else(|| default_spool_dir.to_path_buf());
        let spool = spool_dir.join(format!("{}-{instance}.log", crate::PROCESS_NAME));
        let mut resolver = Self::new(runner, source.aws_cli.clone(), instance, spool);
        resolver.region = source.rds_region.clone();
        resolver.timeout = Duration::from_secs(source.command_timeout);
        Ok(resolver)
    }

    pub fn spool_path(&self) -> &PathBuf {
        &self.spool
    }

    fn command(&self, subcommand: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.aws_cli, self.timeout)
            .args(["rds", subcommand, "--db-instance-identifier", self.instance.as_str()]);
        if let Some(region) = &self.region {
            spec = spec.args(["--region", region.as_str()]);
        }
        spec
    }
}

impl<R: CommandRunner> LogResolver for RdsResolver<R> {
    fn resolve(&mut self, now: NaiveDateTime, attempt: u32) -> Result<SourceIdentity, SourceError> {
        // widen the "written since" window on each retry: 1h, 2h, 4h
        let since = now - chrono::Duration::hours(1_i64 << attempt.min(16));
        let since_ms = since
            .and_local_timezone(chrono::Local)
            .earliest()
            .map(|t| t.timestamp_millis())
            .unwrap_or_else(|| since.and_utc().timestamp_millis());
        let spec = self.command("describe-db-log-files").args([
            "--file-last-written".to_string(),
            since_ms.to_string(),
            "--output".to_string(),
            "json".to_string(),
        ]);
        let output = self.runner.run(&spec)?;
        let listing: DescribeLogFiles =
            serde_json::from_str(&output.stdout).map_err(|e| SourceError::Output {
                program: self.aws_cli.clone(),
                reason: e.to_string(),
            })?;
        let newest = listing
            .files
            .into_iter()
            .max_by_key(|f| f.last_written)
            .ok_or_else(|| SourceError::NoLogFile(self.instance.clone()))?;
        debug!(file = %newest.log_file_name, size = newest.size, "newest RDS log file");
        Ok(SourceIdentity {
            name: newest.log_file_name,
            path: self.spool.clone(),
            size: Some(newest.size),
        })
    }

    fn materialize(&mut self, identity: &SourceIdentity) -> Result<PathBuf, SourceError> {
        let spec = self.command("download-db-log-file-portion").args([
            "--log-file-name",
            identity.name.as_str(),
            "--starting-token",
            "0",
            "--output",
            "text",
        ]);
        let output = self.runner.run(&spec)?;
        std::fs::write(&self.spool, output.stdout)?;
        Ok(self.spool.clone())
    }

    fn release(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.spool)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.spool.display(), error = %e, "could not remove spool file");
        }
    }
}
