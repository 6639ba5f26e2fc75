//! In-memory filesystem for tests that need a fake `/proc`.

use super::FileSystem;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

/// Files and directories kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    files: BTreeMap<PathBuf, String>,
    directories: BTreeSet<PathBuf>,
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file; parent directories are created implicitly.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.files.insert(path, content.into());
    }

    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.directories.insert(path);
    }

    /// Fake `/proc` with the given load averages and CPU count.
    pub fn with_host(load1: f64, cpus: usize) -> Self {
        let mut fs = Self::new();
        fs.add_file(
            "/proc/loadavg",
            format!("{load1:.2} {load1:.2} {load1:.2} 1/200 4321\n"),
        );
        let cpuinfo: String = (0..cpus)
            .map(|n| format!("processor\t: {n}\nmodel name\t: Fake CPU\n\n"))
            .collect();
        fs.add_file("/proc/cpuinfo", cpuinfo);
        fs
    }

    fn add_parents(&mut self, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            if !ancestor.as_os_str().is_empty() {
                self.directories.insert(ancestor.to_path_buf());
            }
        }
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("mock file not found: {}", path.display()),
            )
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path) || self.directories.contains(path)
    }
}
