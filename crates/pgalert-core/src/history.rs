//! Alert history files and their retention.

use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Prefix of the daily history files written next to the alert log.
pub const HISTORY_PREFIX: &str = "alerts-history";

/// Deletes history files last modified more than `keep_days` ago.
/// Returns how many were removed.
pub fn prune(dir: &Path, keep_days: u32, now: SystemTime) -> io::Result<usize> {
    let max_age = Duration::from_secs(u64::from(keep_days) * 86_400);
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(HISTORY_PREFIX) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let age = now
            .duration_since(metadata.modified()?)
            .unwrap_or_default();
        if age <= max_age {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!(file = %entry.path().display(), "removed old history file");
                removed += 1;
            }
            Err(e) => warn!(file = %entry.path().display(), error = %e, "could not remove history file"),
        }
    }
    Ok(removed)
}
