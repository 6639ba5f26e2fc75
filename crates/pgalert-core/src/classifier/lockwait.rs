//! Lock wait lines emitted when `log_lock_waits` is on.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWaitKind {
    /// `... acquired ShareLock on transaction 1234 after 1500.2 ms`
    ShareLock,
    /// `... acquired ExclusiveLock on tuple (0,1) ... after 1500.2 ms`
    ExclusiveLock,
    /// `... still waiting for ShareLock on transaction 1234 after 1000.1 ms`
    StillWaiting,
}

impl LockWaitKind {
    pub const ALL: [LockWaitKind; 3] = [Self::ShareLock, Self::ExclusiveLock, Self::StillWaiting];

    pub fn needle(self) -> &'static str {
        match self {
            Self::ShareLock => "acquired ShareLock on transaction",
            Self::ExclusiveLock => "acquired ExclusiveLock on ",
            Self::StillWaiting => "still waiting for ",
        }
    }

    /// Kinds whose phrase appears in the include filter. A kind not asked
    /// for by the filter is classified like any other line.
    pub fn enabled_by(grep: &str) -> Vec<LockWaitKind> {
        Self::ALL
            .into_iter()
            .filter(|kind| grep.contains(kind.needle().trim_end()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitParseError {
    MissingAfter,
    MissingMilliseconds,
    MissingFraction,
    NotANumber,
}

impl fmt::Display for WaitParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Self::MissingAfter => "no \"after\" marker",
            Self::MissingMilliseconds => "no \"ms\" unit",
            Self::MissingFraction => "no fractional milliseconds",
            Self::NotANumber => "wait time is not a number",
        };
        f.write_str(what)
    }
}

impl std::error::Error for WaitParseError {}

/// Whole seconds waited, read from the `after N.N ms` tail following `needle`.
///
/// Waits under one second count as zero.
pub fn wait_seconds(line: &str, needle: &str) -> Result<u64, WaitParseError> {
    let tail = line
        .find(needle)
        .map(|pos| &line[pos + needle.len()..])
        .unwrap_or(line);
    let after = tail.find("after ").ok_or(WaitParseError::MissingAfter)?;
    let tail = &tail[after + "after ".len()..];
    let ms_pos = tail.find(" ms").ok_or(WaitParseError::MissingMilliseconds)?;
    let amount = tail[..ms_pos].trim();
    let (whole, _) = amount
        .split_once('.')
        .ok_or(WaitParseError::MissingFraction)?;
    let whole = whole.trim();
    if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
        return Err(WaitParseError::NotANumber);
    }
    let millis: u64 = whole.parse().map_err(|_| WaitParseError::NotANumber)?;
    Ok(millis / 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHARE: &str = "2024-03-01 10:15:00 UTC [77] LOG:  process 77 acquired ShareLock on transaction 9912 after 1500.2 ms";

    #[test]
    fn test_wait_seconds() {
        assert_eq!(wait_seconds(SHARE, LockWaitKind::ShareLock.needle()), Ok(1));
        let short = SHARE.replace("1500.2", "500.2");
        assert_eq!(wait_seconds(&short, LockWaitKind::ShareLock.needle()), Ok(0));
        let long = SHARE.replace("1500.2", "62001.9");
        assert_eq!(wait_seconds(&long, LockWaitKind::ShareLock.needle()), Ok(62));
    }

    #[test]
    fn test_wait_seconds_failures() {
        let needle = LockWaitKind::StillWaiting.needle();
        assert_eq!(
            wait_seconds("LOG:  process 1 still waiting for ShareLock", needle),
            Err(WaitParseError::MissingAfter)
        );
        assert_eq!(
            wait_seconds("still waiting for X after 1000.0 seconds", needle),
            Err(WaitParseError::MissingMilliseconds)
        );
        assert_eq!(
            wait_seconds("still waiting for X after 1000 ms", needle),
            Err(WaitParseError::MissingFraction)
        );
        assert_eq!(
            wait_seconds("still waiting for X after abc.5 ms", needle),
            Err(WaitParseError::NotANumber)
        );
    }

    #[test]
    fn test_enabled_by_grep() {
        let kinds = LockWaitKind::enabled_by("ERROR:|acquired ShareLock on transaction|still waiting for");
        assert_eq!(kinds, vec![LockWaitKind::ShareLock, LockWaitKind::StillWaiting]);
        assert!(LockWaitKind::enabled_by("ERROR:|FATAL:").is_empty());
    }
}
