//! Host information read from `/proc`.
//!
//! Reads go through the `FileSystem` trait so health checks can run against
//! `MockFs` in tests and on machines without a Linux `/proc`.

mod mock;
mod parser;

pub use mock::MockFs;
pub use parser::{LoadAvg, ParseError, count_cpus, parse_loadavg};

use std::io;
use std::path::Path;

/// Read-only filesystem operations used by host checks and the run lock.
pub trait FileSystem: Send + Sync {
    /// Reads the whole file as UTF-8.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    fn exists(&self, path: &Path) -> bool;
}

/// `std::fs` backed implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Returns true when `/proc/<pid>` exists under `proc_root`.
pub fn process_alive(fs: &dyn FileSystem, proc_root: &Path, pid: u32) -> bool {
    pid != 0 && fs.exists(&proc_root.join(pid.to_string()))
}
