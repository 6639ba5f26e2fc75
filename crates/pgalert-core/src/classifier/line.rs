use chrono::NaiveDateTime;

/// Width of the `YYYY-MM-DD HH:MM:SS` prefix every valid line starts with.
pub const TIMESTAMP_LEN: usize = 19;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One raw log line with its leading timestamp, if it has one.
///
/// The timestamp is kept as text: the fixed-width format sorts the same
/// lexically and chronologically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    text: String,
    timestamp: Option<String>,
}

impl LogLine {
    pub fn parse(raw: &str) -> Self {
        let text = raw.trim().to_string();
        let timestamp = text
            .get(..TIMESTAMP_LEN)
            .filter(|ts| NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).is_ok())
            .map(str::to_string);
        Self { text, timestamp }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }

    pub fn is_valid(&self) -> bool {
        self.timestamp.is_some()
    }
}
