use regex::Regex;

/// Include/exclude pre-filter applied to raw lines before classification.
#[derive(Debug, Clone)]
pub struct GrepFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

/// Accepts `grep`-style alternation (`a\|b`) as well as plain regex.
fn compile(pattern: &str) -> Result<Option<Regex>, regex::Error> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(&pattern.replace("\\|", "|")).map(Some)
}

impl GrepFilter {
    /// An empty include pattern admits every line.
    pub fn new(include: &str, exclude: Option<&str>) -> Result<Self, regex::Error> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude.unwrap_or_default())?,
        })
    }

    pub fn admits(&self, line: &str) -> bool {
        self.include.as_ref().is_none_or(|re| re.is_match(line))
            && !self.exclude.as_ref().is_some_and(|re| re.is_match(line))
    }
}
