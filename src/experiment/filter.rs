//! Metric exclusion globs and run name allow-lists.
//!
//! Both compile their patterns once up front into an ordered list of
//! regular expressions; matching is a linear scan over that list.

use regex::Regex;

use crate::Result;

/// Ordered list of compiled glob patterns naming metrics to drop.
///
/// Glob syntax: `*` matches any run of characters (including `/`), `?`
/// matches one character, `[abc]` / `[!abc]` match a character class.
/// Patterns are anchored at both ends.
#[derive(Debug, Clone, Default)]
pub struct MetricFilter {
    patterns: Vec<(String, Regex)>,
}

impl MetricFilter {
    /// Filter that excludes nothing.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Compile glob patterns.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPattern` if a pattern cannot be compiled
    pub fn new<S: AsRef<str>>(globs: &[S]) -> Result<Self> {
        let patterns = globs
            .iter()
            .map(|glob| {
                let glob = glob.as_ref();
                Ok((glob.to_string(), Regex::new(&glob_to_regex(glob))?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Whether `metric_name` matches any exclusion pattern.
    #[must_use]
    pub fn is_excluded(&self, metric_name: &str) -> bool {
        self.patterns.iter().any(|(_, re)| re.is_match(metric_name))
    }

    /// Whether the filter has no patterns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The source glob patterns, in evaluation order.
    pub fn globs(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|(glob, _)| glob.as_str())
    }
}

/// Allow-list of run names.
///
/// Each entry is a regular expression anchored at the start of the run
/// name, so a plain run name selects itself and any run it prefixes.
/// An empty selector admits every run.
#[derive(Debug, Clone, Default)]
pub struct RunSelector {
    patterns: Vec<Regex>,
}

impl RunSelector {
    /// Selector admitting every run.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Compile run name patterns.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPattern` if a pattern is not a valid regex
    pub fn new<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let patterns = names
            .iter()
            .map(|name| Regex::new(&format!("^(?:{})", name.as_ref())))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Whether a run with this name should be migrated.
    #[must_use]
    pub fn admits(&self, run_name: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|re| re.is_match(run_name))
    }

    /// Whether the selector restricts anything.
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        !self.patterns.is_empty()
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut raw = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    // `]` right after the opening bracket (or `[!`) is a literal member.
                    if inner == ']' && !(raw.is_empty() || raw == "!") {
                        closed = true;
                        break;
                    }
                    raw.push(inner);
                }
                if closed {
                    out.push('[');
                    let members = raw.strip_prefix('!').map_or(raw.as_str(), |rest| {
                        out.push('^');
                        rest
                    });
                    for member in members.chars() {
                        if matches!(member, '\\' | '[' | ']' | '&' | '~' | '^') {
                            out.push('\\');
                        }
                        out.push(member);
                    }
                    out.push(']');
                } else {
                    // Unterminated class: match the text literally.
                    out.push_str(&regex::escape("["));
                    out.push_str(&regex::escape(&raw));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}
