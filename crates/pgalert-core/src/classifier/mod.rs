//! Alert/suppress decisions for individual log lines.
//!
//! Order of evaluation:
//! 1. lines without a leading timestamp are invalid
//! 2. deadlock reports always alert
//! 3. lock wait reports alert when the wait reaches the threshold
//! 4. denied sqlstate classes and codes are suppressed
//! 5. statement timeouts (57014) follow `alert_stmt_timeout`
//! 6. lines naming an ignored application are suppressed
//! 7. everything else alerts

mod grep;
mod line;
mod lockwait;
mod sqlstate;

pub use grep::GrepFilter;
pub use line::{LogLine, TIMESTAMP_LEN};
pub use lockwait::{LockWaitKind, WaitParseError, wait_seconds};
pub use sqlstate::{Extraction, SqlStateRule, SqlStateRuleError};

use crate::config::FilterRules;
use std::fmt;
use tracing::{debug, warn};

pub const STATEMENT_TIMEOUT_SQLSTATE: &str = "57014";
const USER_CANCEL: &str = "canceling statement due to user request";
const TIMEOUT_CANCEL: &str = "canceling statement due to statement timeout";
const DEADLOCK_PHRASES: [&str; 2] = ["detected deadlock while waiting for", "deadlock detected"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Alert,
    Suppress(SuppressReason),
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuppressReason {
    LockFilter,
    LockWaitBelowThreshold { seconds: u64, threshold: u64 },
    LockWaitUnparsed(WaitParseError),
    DeniedSqlClass(String),
    DeniedSqlState(String),
    StatementTimeout,
    IgnoredApplication(String),
}

impl fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockFilter => write!(f, "matches lock filter"),
            Self::LockWaitBelowThreshold { seconds, threshold } => {
                write!(f, "lock wait {seconds}s below threshold {threshold}s")
            }
            Self::LockWaitUnparsed(e) => write!(f, "lock wait time unreadable: {e}"),
            Self::DeniedSqlClass(class) => write!(f, "sqlstate class {class} denied"),
            Self::DeniedSqlState(code) => write!(f, "sqlstate {code} denied"),
            Self::StatementTimeout => write!(f, "statement timeout"),
            Self::IgnoredApplication(app) => write!(f, "application {app} ignored"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub decision: Decision,
    pub sqlstate: Option<String>,
}

impl Classification {
    fn new(decision: Decision) -> Self {
        Self {
            decision,
            sqlstate: None,
        }
    }
}

#[derive(Debug, Clone)]
enum SqlStateCheck {
    Active(SqlStateRule),
    Unavailable,
    /// A line broke the rule's assumptions; stays off for the rest of the run.
    Degraded,
}

/// Stateful classifier: holds the compiled filters and the sqlstate rule.
#[derive(Debug, Clone)]
pub struct LineClassifier {
    grep: GrepFilter,
    lock_kinds: Vec<LockWaitKind>,
    sqlstate: SqlStateCheck,
}

impl LineClassifier {
    pub fn new(filters: &FilterRules, rule: Option<SqlStateRule>) -> Result<Self, regex::Error> {
        Ok(Self {
            grep: GrepFilter::new(&filters.grep, filters.grep_exclude.as_deref())?,
            lock_kinds: LockWaitKind::enabled_by(&filters.grep),
            sqlstate: rule.map_or(SqlStateCheck::Unavailable, SqlStateCheck::Active),
        })
    }

    /// Recompiles filters after a config refresh. A degraded sqlstate rule
    /// is not revived.
    pub fn update_filters(&mut self, filters: &FilterRules) -> Result<(), regex::Error> {
        self.grep = GrepFilter::new(&filters.grep, filters.grep_exclude.as_deref())?;
        self.lock_kinds = LockWaitKind::enabled_by(&filters.grep);
        Ok(())
    }

    /// Include/exclude pre-filter.
    pub fn admits(&self, text: &str) -> bool {
        self.grep.admits(text)
    }

    pub fn sqlstate_enabled(&self) -> bool {
        matches!(self.sqlstate, SqlStateCheck::Active(_))
    }

    pub fn classify(&mut self, line: &LogLine, filters: &FilterRules) -> Classification {
        if !line.is_valid() {
            return Classification::new(Decision::Invalid);
        }
        let text = line.text();

        if DEADLOCK_PHRASES.iter().any(|p| text.contains(p)) {
            return Classification::new(Decision::Alert);
        }

        if let Some(kind) = self.lock_kinds.iter().find(|k| text.contains(k.needle())) {
            return Classification::new(lock_wait_decision(text, *kind, filters));
        }

        let sqlstate = self.extract_sqlstate(text);
        let decision = match &sqlstate {
            Some(code) => sqlstate_decision(code, text, filters),
            None => None,
        }
        .or_else(|| {
            filters
                .ignore_apps
                .iter()
                .find(|app| !app.is_empty() && text.contains(app.as_str()))
                .map(|app| Decision::Suppress(SuppressReason::IgnoredApplication(app.clone())))
        })
        .unwrap_or(Decision::Alert);

        Classification { decision, sqlstate }
    }

    fn extract_sqlstate(&mut self, text: &str) -> Option<String> {
        let SqlStateCheck::Active(rule) = &self.sqlstate else {
            return None;
        };
        match rule.extract(text) {
            Extraction::Found(code) => Some(code),
            Extraction::NotPresent => {
                debug!("sqlstate delimiters not found in line");
                None
            }
            Extraction::Malformed(found) => {
                warn!(
                    found = %found,
                    "unexpected sqlstate value, disabling sqlstate checks for this run"
                );
                self.sqlstate = SqlStateCheck::Degraded;
                None
            }
        }
    }
}

fn lock_wait_decision(text: &str, kind: LockWaitKind, filters: &FilterRules) -> Decision {
    if let Some(filter) = filters.lockfilter.as_deref()
        && !filter.is_empty()
        && text.contains(filter)
    {
        return Decision::Suppress(SuppressReason::LockFilter);
    }
    match wait_seconds(text, kind.needle()) {
        Ok(seconds) if seconds >= filters.lockwait => Decision::Alert,
        Ok(seconds) => Decision::Suppress(SuppressReason::LockWaitBelowThreshold {
            seconds,
            threshold: filters.lockwait,
        }),
        Err(e) => {
            warn!(error = %e, "could not find time waited in lock wait line");
            Decision::Suppress(SuppressReason::LockWaitUnparsed(e))
        }
    }
}

/// `None` means the code does not settle the decision.
fn sqlstate_decision(code: &str, text: &str, filters: &FilterRules) -> Option<Decision> {
    if let Some(class) = filters
        .sqlclass
        .iter()
        .find(|class| !class.is_empty() && code.starts_with(class.as_str()))
    {
        return Some(Decision::Suppress(SuppressReason::DeniedSqlClass(class.clone())));
    }
    if filters.sqlstate.iter().any(|denied| denied == code) {
        return Some(Decision::Suppress(SuppressReason::DeniedSqlState(code.to_string())));
    }
    if code != STATEMENT_TIMEOUT_SQLSTATE {
        return None;
    }
    if filters.alert_stmt_timeout || text.contains(USER_CANCEL) || !text.contains(TIMEOUT_CANCEL) {
        Some(Decision::Alert)
    } else {
        Some(Decision::Suppress(SuppressReason::StatementTimeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "%m [%p] <%e> ";

    fn filters() -> FilterRules {
        FilterRules {
            grep: "ERROR:|FATAL:|deadlock|acquired ShareLock on transaction|still waiting for"
                .to_string(),
            ..FilterRules::default()
        }
    }

    fn classifier(filters: &FilterRules) -> LineClassifier {
        let rule = SqlStateRule::from_log_line_prefix(PREFIX).unwrap();
        LineClassifier::new(filters, Some(rule)).unwrap()
    }

    fn classify(filters: &FilterRules, raw: &str) -> Decision {
        classifier(filters).classify(&LogLine::parse(raw), filters).decision
    }

    #[test]
    fn test_invalid_line() {
        let f = filters();
        assert_eq!(classify(&f, "\tDETAIL:  deadlock detected"), Decision::Invalid);
    }

    #[test]
    fn test_deadlock_alerts_even_when_class_denied() {
        let mut f = filters();
        f.sqlclass = vec!["40".to_string()];
        let raw = "2024-03-01 10:15:00.1 UTC [9] <40P01> ERROR:  deadlock detected";
        assert_eq!(classify(&f, raw), Decision::Alert);
    }

    #[test]
    fn test_lock_wait_threshold() {
        let mut f = filters();
        f.lockwait = 1;
        let base = "2024-03-01 10:15:00 UTC [9] <00000> LOG:  process 9 acquired ShareLock on transaction 5 after WAIT ms";
        assert_eq!(
            classify(&f, &base.replace("WAIT", "500.2")),
            Decision::Suppress(SuppressReason::LockWaitBelowThreshold {
                seconds: 0,
                threshold: 1
            })
        );
        assert_eq!(classify(&f, &base.replace("WAIT", "1500.2")), Decision::Alert);
        assert!(matches!(
            classify(&f, &base.replace("WAIT", "1500")),
            Decision::Suppress(SuppressReason::LockWaitUnparsed(_))
        ));
    }

    #[test]
    fn test_lock_filter() {
        let mut f = filters();
        f.lockfilter = Some("on transaction 5 ".to_string());
        let raw = "2024-03-01 10:15:00 UTC [9] <00000> LOG:  process 9 acquired ShareLock on transaction 5 after 9000.0 ms";
        assert_eq!(classify(&f, raw), Decision::Suppress(SuppressReason::LockFilter));

        f.lockfilter = Some(String::new());
        assert_eq!(classify(&f, raw), Decision::Alert);
    }

    #[test]
    fn test_lock_kind_not_in_grep_is_ordinary() {
        let mut f = filters();
        f.grep = "LOG:".to_string();
        let raw = "2024-03-01 10:15:00 UTC [9] <00000> LOG:  process 9 still waiting for ShareLock after 10.0 ms";
        assert_eq!(classify(&f, raw), Decision::Alert);
    }

    #[test]
    fn test_denied_class_and_state() {
        let mut f = filters();
        f.sqlclass = vec!["08".to_string()];
        f.sqlstate = vec!["42P01".to_string()];

        let mut c = classifier(&f);
        let line = LogLine::parse("2024-03-01 10:15:00 UTC [9] <08006> FATAL:  connection failure");
        let result = c.classify(&line, &f);
        assert_eq!(
            result.decision,
            Decision::Suppress(SuppressReason::DeniedSqlClass("08".to_string()))
        );
        assert_eq!(result.sqlstate.as_deref(), Some("08006"));

        let raw = "2024-03-01 10:15:00 UTC [9] <42P01> ERROR:  relation does not exist";
        assert_eq!(
            classify(&f, raw),
            Decision::Suppress(SuppressReason::DeniedSqlState("42P01".to_string()))
        );
        let raw = "2024-03-01 10:15:00 UTC [9] <42601> ERROR:  syntax error";
        assert_eq!(classify(&f, raw), Decision::Alert);
    }

    #[test]
    fn test_statement_timeout() {
        let mut f = filters();
        let timeout = "2024-03-01 10:15:00 UTC [9] <57014> ERROR:  canceling statement due to statement timeout";
        let user = "2024-03-01 10:15:00 UTC [9] <57014> ERROR:  canceling statement due to user request";
        let other = "2024-03-01 10:15:00 UTC [9] <57014> ERROR:  canceling autovacuum task";

        assert_eq!(classify(&f, timeout), Decision::Suppress(SuppressReason::StatementTimeout));
        assert_eq!(classify(&f, user), Decision::Alert);
        assert_eq!(classify(&f, other), Decision::Alert);

        f.alert_stmt_timeout = true;
        assert_eq!(classify(&f, timeout), Decision::Alert);
    }

    #[test]
    fn test_ignored_application() {
        let mut f = filters();
        f.ignore_apps = vec![String::new(), "pg_dump".to_string()];
        let raw = "2024-03-01 10:15:00 UTC [9] <42501> ERROR:  permission denied app=pg_dump";
        assert_eq!(
            classify(&f, raw),
            Decision::Suppress(SuppressReason::IgnoredApplication("pg_dump".to_string()))
        );
    }

    #[test]
    fn test_malformed_sqlstate_degrades_for_rest_of_run() {
        let mut f = filters();
        f.sqlclass = vec!["08".to_string()];
        let mut c = classifier(&f);
        assert!(c.sqlstate_enabled());

        let odd = LogLine::parse("2024-03-01 10:15:00 UTC [9] <0 8> FATAL:  odd");
        assert_eq!(c.classify(&odd, &f).decision, Decision::Alert);
        assert!(!c.sqlstate_enabled());

        // denied class no longer applies once degraded
        c.update_filters(&f).unwrap();
        let denied = LogLine::parse("2024-03-01 10:15:00 UTC [9] <08006> FATAL:  conn");
        let result = c.classify(&denied, &f);
        assert_eq!(result.decision, Decision::Alert);
        assert_eq!(result.sqlstate, None);
    }

    #[test]
    fn test_without_rule_classifies_by_text() {
        let f = filters();
        let mut c = LineClassifier::new(&f, None).unwrap();
        let line = LogLine::parse("2024-03-01 10:15:00 UTC [9] <57014> ERROR:  canceling statement due to statement timeout");
        assert_eq!(c.classify(&line, &f).decision, Decision::Alert);
    }
}
