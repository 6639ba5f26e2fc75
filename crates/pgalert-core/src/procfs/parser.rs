//! Parsers for `/proc/loadavg` and `/proc/cpuinfo`.

/// Error type for parsing failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Load averages from `/proc/loadavg`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadAvg {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

/// Parses `/proc/loadavg`.
///
/// Format: `0.50 0.40 0.30 2/345 6789`. Only the three averages are kept.
pub fn parse_loadavg(content: &str) -> Result<LoadAvg, ParseError> {
    let mut parts = content.split_whitespace();
    let mut next = |name: &str| -> Result<f64, ParseError> {
        parts
            .next()
            .ok_or_else(|| ParseError::new(format!("missing {name}")))?
            .parse()
            .map_err(|_| ParseError::new(format!("invalid {name}")))
    };

    Ok(LoadAvg {
        load1: next("load1")?,
        load5: next("load5")?,
        load15: next("load15")?,
    })
}

/// Counts `processor` entries in `/proc/cpuinfo`. Never returns less than 1.
pub fn count_cpus(cpuinfo: &str) -> usize {
    let count = cpuinfo
        .lines()
        .filter(|line| {
            line.split_once(':')
                .is_some_and(|(key, _)| key.trim() == "processor")
        })
        .count();
    count.max(1)
}
