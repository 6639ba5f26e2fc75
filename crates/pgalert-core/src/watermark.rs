//! Re-delivery guard.
//!
//! A rotated or re-downloaded log is read again from the start; lines older
//! than the newest one already alerted on must not alert twice.

use std::collections::HashSet;

/// Timestamp of the newest alerted line, plus the texts alerted at exactly
/// that second.
#[derive(Debug, Clone, Default)]
pub struct Watermark {
    current: Option<String>,
    seen_at_current: HashSet<String>,
}

impl Watermark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// True when `ts` is strictly older than the watermark.
    pub fn is_behind(&self, ts: &str) -> bool {
        self.current.as_deref().is_some_and(|cur| ts < cur)
    }

    /// Admits a line for alerting and advances the watermark. Rejects lines
    /// behind the watermark and repeats of a line already admitted at the
    /// watermark second.
    pub fn admit(&mut self, ts: &str, text: &str) -> bool {
        if self.is_behind(ts) {
            return false;
        }
        if self.current.as_deref() == Some(ts) {
            return self.seen_at_current.insert(text.to_string());
        }
        self.current = Some(ts.to_string());
        self.seen_at_current.clear();
        self.seen_at_current.insert(text.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let mut wm = Watermark::new();
        assert!(wm.admit("2024-03-01 10:00:00", "a"));
        assert!(wm.admit("2024-03-01 10:00:05", "b"));
        assert!(!wm.admit("2024-03-01 10:00:01", "c"));
        assert_eq!(wm.current(), Some("2024-03-01 10:00:05"));
        assert!(wm.is_behind("2024-03-01 09:59:59"));
        assert!(!wm.is_behind("2024-03-01 10:00:05"));
    }

    #[test]
    fn test_same_second_distinct_lines_pass() {
        let mut wm = Watermark::new();
        assert!(wm.admit("2024-03-01 10:00:00", "first"));
        assert!(wm.admit("2024-03-01 10:00:00", "second"));
        // rescan of the same tail
        assert!(!wm.admit("2024-03-01 10:00:00", "first"));
        assert!(!wm.admit("2024-03-01 10:00:00", "second"));
    }
}
