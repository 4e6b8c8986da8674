//! File name patterns
//!
//! A pattern is either a glob (`*.csv`, `claims_????.txt`) or a regular
//! expression prefixed with `regex:` (`regex:^claims_\d+\.csv$`). Both match
//! the whole file name, never a path.
//!
//! Output names are rendered from templates by [`render_filename`].

use crate::error::{IntegrationError, Result};
use chrono::Utc;
use regex::Regex;
use std::fmt;
use uuid::Uuid;

#[derive(Clone)]
pub struct FilePattern {
    source: String,
    /// `None` matches every name
    regex: Option<Regex>,
}

impl FilePattern {
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern == "*" {
            return Ok(Self::any());
        }
        let expression = match pattern.strip_prefix("regex:") {
            Some(expression) => expression.to_string(),
            None => glob_to_regex(pattern),
        };
        let regex = Regex::new(&expression).map_err(|e| {
            IntegrationError::config(format!("invalid file pattern '{}': {}", pattern, e))
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex: Some(regex),
        })
    }

    /// Pattern matching every file
    pub fn any() -> Self {
        Self {
            source: "*".to_string(),
            regex: None,
        }
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.regex.as_ref().map_or(true, |r| r.is_match(file_name))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut expression = String::with_capacity(glob.len() + 8);
    expression.push('^');
    for c in glob.chars() {
        match c {
            '*' => expression.push_str(".*"),
            '?' => expression.push('.'),
            other => expression.push_str(&regex::escape(&other.to_string())),
        }
    }
    expression.push('$');
    expression
}

impl fmt::Debug for FilePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilePattern({})", self.source)
    }
}

impl fmt::Display for FilePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for FilePattern {
    type Err = IntegrationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Render an output file name.
///
/// Placeholders: `{flow}`, `{timestamp}` (`YYYYMMDD_HHMMSS`, UTC),
/// `{date}` (`YYYYMMDD`), `{uuid}` and `{ext}` (without the leading dot).
pub fn render_filename(pattern: &str, flow: &str, ext: &str) -> String {
    let now = Utc::now();
    let mut name = pattern
        .replace("{flow}", flow)
        .replace("{timestamp}", &now.format("%Y%m%d_%H%M%S").to_string())
        .replace("{date}", &now.format("%Y%m%d").to_string())
        .replace("{ext}", ext.trim_start_matches('.'));
    if name.contains("{uuid}") {
        name = name.replace("{uuid}", &Uuid::new_v4().simple().to_string());
    }
    name
}
