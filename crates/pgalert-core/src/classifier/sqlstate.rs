//! Sqlstate extraction driven by the server's `log_line_prefix`.
//!
//! The literal text around the `%e` escape delimits the five character
//! error code in every log line.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqlStateRuleError {
    #[error("log_line_prefix has no %e escape")]
    NoEscape,
    #[error("log_line_prefix has no literal text on both sides of %e")]
    EmptyDelimiter,
    #[error("delimiter {0:?} occurs more than once in log_line_prefix")]
    AmbiguousDelimiter(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Found(String),
    /// Delimiters not present in the line.
    NotPresent,
    /// Something other than an alphanumeric code sits between the delimiters.
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Escape(char),
}

fn segments(template: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => literal.push('%'),
            Some(esc) => {
                if !literal.is_empty() {
                    out.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                out.push(Segment::Escape(esc));
            }
            None => literal.push('%'),
        }
    }
    if !literal.is_empty() {
        out.push(Segment::Literal(literal));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStateRule {
    prefix: String,
    postfix: String,
}

impl SqlStateRule {
    /// Derives the delimiters from a `log_line_prefix` template.
    ///
    /// Each delimiter must occur exactly once in the template, otherwise the
    /// code cannot be located reliably.
    pub fn from_log_line_prefix(template: &str) -> Result<Self, SqlStateRuleError> {
        let segs = segments(template);
        let pos = segs
            .iter()
            .position(|s| *s == Segment::Escape('e'))
            .ok_or(SqlStateRuleError::NoEscape)?;

        let literal_at = |idx: Option<usize>| match idx.and_then(|i| segs.get(i)) {
            Some(Segment::Literal(text)) => text.clone(),
            _ => String::new(),
        };
        let prefix = literal_at(pos.checked_sub(1));
        let postfix = literal_at(Some(pos + 1));
        if prefix.is_empty() || postfix.is_empty() {
            return Err(SqlStateRuleError::EmptyDelimiter);
        }
        for delimiter in [&prefix, &postfix] {
            if template.matches(delimiter.as_str()).count() != 1 {
                return Err(SqlStateRuleError::AmbiguousDelimiter(delimiter.clone()));
            }
        }
        Ok(Self { prefix, postfix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn postfix(&self) -> &str {
        &self.postfix
    }

    pub fn extract(&self, line: &str) -> Extraction {
        let Some(start) = line.find(&self.prefix) else {
            return Extraction::NotPresent;
        };
        let rest = &line[start + self.prefix.len()..];
        let Some(end) = rest.find(&self.postfix) else {
            return Extraction::NotPresent;
        };
        let code = rest[..end].trim();
        if !code.is_empty() && code.chars().all(|c| c.is_ascii_alphanumeric()) {
            Extraction::Found(code.to_string())
        } else {
            Extraction::Malformed(code.to_string())
        }
    }
}
