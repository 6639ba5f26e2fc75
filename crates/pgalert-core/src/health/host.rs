//! Host checks: load average, filesystem usage, `pgsql_tmp` size.

use super::{CheckContext, HealthError, HealthProbe};
use crate::limiter::AlertCategory;
use crate::procfs::{FileSystem, count_cpus, parse_loadavg};
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::Disks;

/// Usage of one mounted filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountUsage {
    pub mount_point: PathBuf,
    pub total: u64,
    pub available: u64,
}

/// Percent used of the filesystem holding `path` (longest mount prefix).
pub fn usage_for_path(mounts: &[MountUsage], path: &Path) -> Option<u64> {
    let mount = mounts
        .iter()
        .filter(|m| path.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.components().count())?;
    if mount.total == 0 {
        return None;
    }
    let used = mount.total.saturating_sub(mount.available);
    Some(used * 100 / mount.total)
}

/// Total size of regular files below `path`. Symlinks are not followed.
pub fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.path().symlink_metadata()?;
        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else if metadata.is_file() {
            total += metadata.len();
        }
    }
    Ok(total)
}

/// Human readable size: GB, MB or bytes.
pub fn format_bytes(bytes: u64) -> String {
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else {
        format!("{bytes} bytes")
    }
}

pub struct HostHealth<F: FileSystem> {
    fs: F,
    proc_root: PathBuf,
    data_directory: Option<PathBuf>,
    wal_directory: Option<PathBuf>,
    disks: Option<Disks>,
}

impl<F: FileSystem> HostHealth<F> {
    /// `data_directory` and `wal_directory` are known only when the server
    /// could be asked for its settings; without them only load is checked.
    pub fn new(fs: F, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            proc_root: proc_root.into(),
            data_directory: None,
            wal_directory: None,
            disks: None,
        }
    }

    pub fn with_directories(mut self, data: PathBuf, wal: PathBuf) -> Self {
        self.data_directory = Some(data);
        self.wal_directory = Some(wal);
        self.disks = Some(Disks::new_with_refreshed_list());
        self
    }

    fn read_proc(&self, name: &str) -> Result<String, HealthError> {
        self.fs
            .read_to_string(&self.proc_root.join(name))
            .map_err(|e| HealthError::Host {
                what: format!("{}/{name}", self.proc_root.display()),
                reason: e.to_string(),
            })
    }

    fn check_load(&self, ctx: &mut CheckContext<'_>) -> Result<(), HealthError> {
        let load = parse_loadavg(&self.read_proc("loadavg")?).map_err(|e| HealthError::Host {
            what: "loadavg".into(),
            reason: e.to_string(),
        })?;
        let cpus = count_cpus(&self.read_proc("cpuinfo")?);
        let pct = ctx.config.thresholds.load;
        let limit = cpus as f64 * f64::from(pct) / 100.0;
        if load.load1 > limit {
            ctx.raise(
                AlertCategory::Load,
                format!(
                    "Current load ({:.2}) exceeds {pct}% of {cpus} CPUs ({limit:.2}).",
                    load.load1
                ),
            );
        }
        Ok(())
    }

    fn mounts(&mut self) -> Vec<MountUsage> {
        let Some(disks) = self.disks.as_mut() else {
            return Vec::new();
        };
        disks.refresh_list();
        disks
            .iter()
            .map(|d| MountUsage {
                mount_point: d.mount_point().to_path_buf(),
                total: d.total_space(),
                available: d.available_space(),
            })
            .collect()
    }

    fn check_directories(&mut self, ctx: &mut CheckContext<'_>) {
        let mounts = self.mounts();
        let threshold = u64::from(ctx.config.thresholds.directory);
        let dirs = [
            (AlertCategory::DataDirectory, "Data directory", &self.data_directory),
            (AlertCategory::WalDirectory, "WAL directory", &self.wal_directory),
        ];
        for (category, label, dir) in dirs {
            let Some(dir) = dir else { continue };
            // WAL is often a symlink to another volume
            let real = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.clone());
            if let Some(used) = usage_for_path(&mounts, &real)
                && used > threshold
            {
                ctx.raise(
                    category,
                    format!(
                        "{label} {} is {used}% full (threshold {threshold}%).",
                        real.display()
                    ),
                );
            }
        }
    }

    fn check_pgsql_tmp(&self, ctx: &mut CheckContext<'_>) -> Result<(), HealthError> {
        let (Some(threshold), Some(data)) = (ctx.config.thresholds.pgsql_tmp, &self.data_directory) else {
            return Ok(());
        };
        let tmp = data.join("base").join("pgsql_tmp");
        if !tmp.is_dir() {
            return Ok(());
        }
        let size = dir_size(&tmp).map_err(|e| HealthError::Host {
            what: tmp.display().to_string(),
            reason: e.to_string(),
        })?;
        if size > threshold {
            ctx.raise(
                AlertCategory::TempDirectory,
                format!(
                    "pgsql_tmp size ({}) exceeds threshold ({}).",
                    format_bytes(size),
                    format_bytes(threshold)
                ),
            );
        }
        Ok(())
    }
}

impl<F: FileSystem> HealthProbe for HostHealth<F> {
    fn name(&self) -> &'static str {
        "host"
    }

    fn check(&mut self, ctx: &mut CheckContext<'_>) -> Result<(), HealthError> {
        self.check_directories(ctx);
        self.check_pgsql_tmp(ctx)?;
        self.check_load(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::{RateLimitScope, RateLimiter};
    use crate::procfs::MockFs;
    use std::time::Instant;

    fn mount(point: &str, total: u64, available: u64) -> MountUsage {
        MountUsage {
            mount_point: PathBuf::from(point),
            total,
            available,
        }
    }

    #[test]
    fn test_usage_picks_longest_mount() {
        let mounts = [mount("/", 100, 90), mount("/var/lib/pgsql", 1000, 50)];
        assert_eq!(usage_for_path(&mounts, Path::new("/var/lib/pgsql/16/data")), Some(95));
        assert_eq!(usage_for_path(&mounts, Path::new("/home")), Some(10));
        assert_eq!(usage_for_path(&[], Path::new("/home")), None);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 2), "1.5 GB");
    }

    #[test]
    fn test_dir_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("sub").join("b"), vec![0u8; 50]).unwrap();
        assert_eq!(dir_size(dir.path()).unwrap(), 150);
    }

    fn run(host: &mut HostHealth<MockFs>, configure: impl FnOnce(&mut crate::config::Config)) -> Vec<String> {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::tests::sample_config(dir.path());
        configure(&mut config);
        let mut limiter = RateLimiter::new(RateLimitScope::PerCategory, 100);
        let mut ctx = CheckContext::new(&config, &mut limiter, Instant::now(), "ts".into());
        host.check(&mut ctx).unwrap();
        ctx.into_alerts()
    }

    #[test]
    fn test_load_over_threshold() {
        let mut host = HostHealth::new(MockFs::with_host(9.0, 4), "/proc");
        let alerts = run(&mut host, |c| c.thresholds.load = 200);
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("Current load (9.00) exceeds 200% of 4 CPUs (8.00)"));

        let mut host = HostHealth::new(MockFs::with_host(7.5, 4), "/proc");
        assert!(run(&mut host, |c| c.thresholds.load = 200).is_empty());
    }

    #[test]
    fn test_pgsql_tmp_over_threshold() {
        let data = tempfile::tempdir().unwrap();
        let tmp = data.path().join("base").join("pgsql_tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(tmp.join("pgsql_tmp123.0"), vec![0u8; 4096]).unwrap();

        let mut host = HostHealth::new(MockFs::with_host(0.1, 2), "/proc");
        host.data_directory = Some(data.path().to_path_buf());
        let alerts = run(&mut host, |c| c.thresholds.pgsql_tmp = Some(1024));
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("pgsql_tmp size (4096 bytes) exceeds threshold (1024 bytes)"));
    }

    #[test]
    fn test_missing_proc_is_error() {
        let mut host = HostHealth::new(MockFs::new(), "/proc");
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::tests::sample_config(dir.path());
        let mut limiter = RateLimiter::new(RateLimitScope::PerCategory, 100);
        let mut ctx = CheckContext::new(&config, &mut limiter, Instant::now(), "ts".into());
        assert!(matches!(host.check(&mut ctx), Err(HealthError::Host { .. })));
    }
}
