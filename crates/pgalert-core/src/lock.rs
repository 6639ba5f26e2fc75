//! Single-instance run lock: a pid file in the lock directory.

use crate::procfs::{FileSystem, RealFs, process_alive};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("already running with pid {pid} (lock file {path})")]
    Held { pid: u32, path: PathBuf },
    #[error("cannot use lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held for the lifetime of the process; the file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(dir: &Path, name: &str) -> Result<Self, LockError> {
        Self::acquire_with(dir, name, std::process::id(), &RealFs, Path::new("/proc"))
    }

    /// A lock file whose pid is no longer running is stale and replaced.
    pub fn acquire_with(
        dir: &Path,
        name: &str,
        pid: u32,
        proc_fs: &dyn FileSystem,
        proc_root: &Path,
    ) -> Result<Self, LockError> {
        let path = dir.join(format!("{name}.pid"));
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{pid}").map_err(io_err)?;
                    debug!(path = %path.display(), pid, "run lock acquired");
                    return Ok(Self { path: path.clone() });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let content = fs::read_to_string(&path).unwrap_or_default();
                    if let Ok(holder) = content.trim().parse::<u32>()
                        && holder != pid
                        && process_alive(proc_fs, proc_root, holder)
                    {
                        return Err(LockError::Held {
                            pid: holder,
                            path: path.clone(),
                        });
                    }
                    warn!(path = %path.display(), content = content.trim(), "removing stale lock file");
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(io_err(e)),
                    }
                }
                Err(e) => return Err(io_err(e)),
            }
        }
        Err(io_err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "lock file reappeared while replacing it",
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove lock file");
        }
    }
}
