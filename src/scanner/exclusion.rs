//! Exclusion rules evaluated by the tree builder before descending.
//!
//! Rule forms, checked against project-relative keys (`src/lib.rs`):
//! - **Exact path** (`docs/generated`): the key itself or anything nested
//!   under it.
//! - **Bare name** (`node_modules`, `Cargo.lock`): any path segment with that
//!   name, at any depth. A matching directory excludes its whole subtree.
//! - **Glob** (`**/*.min.js`, `build/*`): `**` crosses separators, `*` and `?`
//!   stay within one segment. A glob without `/` is matched against each
//!   segment name, so `*.log` excludes log files at every depth.

#![allow(missing_docs)]

use regex::Regex;

use crate::core::config::Config;
use crate::core::errors::{Result, TreesumError};
use crate::core::paths::{ProjectPaths, ROOT_KEY, normalize_key};

/// One compiled exclusion rule.
#[derive(Debug, Clone)]
enum Rule {
    Path(String),
    Name(String),
    Glob {
        original: String,
        compiled: Regex,
        segment_only: bool,
    },
}

/// Ordered set of compiled exclusion rules.
#[derive(Debug, Clone, Default)]
pub struct ExclusionRules {
    rules: Vec<Rule>,
}

impl ExclusionRules {
    /// Compile rules in order. Fails on the first uncompilable glob.
    pub fn new<S: AsRef<str>>(raw_rules: &[S]) -> Result<Self> {
        let rules = raw_rules
            .iter()
            .map(|raw| compile_rule(raw.as_ref()))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();
        Ok(Self { rules })
    }

    /// Configured rules plus the project's own state directory, so cache
    /// files never feed back into the fingerprints they describe.
    pub fn for_project(config: &Config, paths: &ProjectPaths) -> Result<Self> {
        let mut rules = Self::new(&config.scan.exclude)?;
        if let Some(key) = paths.state_dir_key() {
            rules.push(&key)?;
        }
        Ok(rules)
    }

    /// Add one more rule.
    pub fn push(&mut self, raw: &str) -> Result<()> {
        if let Some(rule) = compile_rule(raw)? {
            self.rules.push(rule);
        }
        Ok(())
    }

    /// Number of active rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether `key` (or any of its ancestors) is excluded. The root never is.
    #[must_use]
    pub fn is_excluded(&self, key: &str) -> bool {
        !self.rules.is_empty() && self.matching_rule(key).is_some()
    }

    /// The original text of the first rule excluding `key`, if any.
    #[must_use]
    pub fn matching_rule(&self, key: &str) -> Option<&str> {
        if key == ROOT_KEY {
            return None;
        }
        self.rules
            .iter()
            .find(|rule| rule_matches(rule, key))
            .map(|rule| match rule {
                Rule::Path(p) => p.as_str(),
                Rule::Name(n) => n.as_str(),
                Rule::Glob { original, .. } => original.as_str(),
            })
    }
}

fn rule_matches(rule: &Rule, key: &str) -> bool {
    match rule {
        Rule::Path(path) => {
            key == path
                || key
                    .strip_prefix(path.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        }
        Rule::Name(name) => key.split('/').any(|segment| segment == name),
        Rule::Glob {
            compiled,
            segment_only,
            ..
        } => {
            if *segment_only {
                key.split('/').any(|segment| compiled.is_match(segment))
            } else {
                // Check the key and every ancestor prefix so that a glob
                // naming a directory also covers everything beneath it.
                let mut end = key.len();
                loop {
                    if compiled.is_match(&key[..end]) {
                        return true;
                    }
                    match key[..end].rfind('/') {
                        Some(idx) => end = idx,
                        None => return false,
                    }
                }
            }
        }
    }
}

fn compile_rule(raw: &str) -> Result<Option<Rule>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let normalized = normalize_key(trimmed);
    if normalized == ROOT_KEY {
        return Err(TreesumError::InvalidConfig {
            details: format!("exclusion rule {raw:?} would exclude the project root"),
        });
    }

    let is_glob = normalized.contains(['*', '?']);
    let has_sep = normalized.contains('/');

    Ok(Some(match (is_glob, has_sep) {
        (true, _) => Rule::Glob {
            compiled: glob_to_regex(&normalized)?,
            segment_only: !has_sep,
            original: normalized,
        },
        (false, true) => Rule::Path(normalized),
        (false, false) => Rule::Name(normalized),
    }))
}

/// Validate that an exclusion rule can be compiled.
pub fn validate_rule(rule: &str) -> Result<()> {
    compile_rule(rule).map(|_| ())
}

/// Convert a shell-style glob pattern to a regex.
///
/// Supports:
/// - `**` → matches any path (including separators)
/// - `*`  → matches anything except `/`
/// - `?`  → matches a single character except `/`
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut regex_str = String::with_capacity(pattern.len() * 2);
    regex_str.push('^');

    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if i + 1 < chars.len() && chars[i + 1] == '*' => {
                if i + 2 < chars.len() && chars[i + 2] == '/' {
                    regex_str.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    regex_str.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                regex_str.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                regex_str.push_str("[^/]");
                i += 1;
            }
            '.' | '+' | '(' | ')' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                regex_str.push('\\');
                regex_str.push(chars[i]);
                i += 1;
            }
            c => {
                regex_str.push(c);
                i += 1;
            }
        }
    }

    regex_str.push('$');

    Regex::new(&regex_str).map_err(|err| TreesumError::InvalidConfig {
        details: format!("invalid exclusion glob {pattern:?}: {err}"),
    })
}
