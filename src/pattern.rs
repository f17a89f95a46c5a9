//! Match predicate for `extract`, `list`, and `md-list`.
//!
//! Three modes: literal (exact name), glob (shell wildcards), regex.
//! Patterns are applied client-side; an empty pattern list matches
//! everything.

use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatternError {
    #[error("bad pattern '{pattern}': {reason}")]
    Bad { pattern: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    Literal,
    #[default]
    Glob,
    Regex,
}

impl MatchMode {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "literal" => Some(MatchMode::Literal),
            "glob"    => Some(MatchMode::Glob),
            "regex"   => Some(MatchMode::Regex),
            _         => None,
        }
    }
}

enum Compiled {
    Literal(Vec<String>),
    Regex(Vec<Regex>),
}

pub struct Matcher(Option<Compiled>);

fn glob_to_regex(glob: &str) -> String {
    let mut re = String::with_capacity(glob.len() + 8);
    re.push('^');
    for c in glob.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c if "\\.+()[]{}^$|".contains(c) => {
                re.push('\\');
                re.push(c);
            }
            c => re.push(c),
        }
    }
    re.push('$');
    re
}

impl Matcher {
    /// Compile a pattern list.  No patterns means match-all.
    pub fn compile(mode: MatchMode, patterns: &[String]) -> Result<Self, PatternError> {
        if patterns.is_empty() {
            return Ok(Matcher(None));
        }
        let compiled = match mode {
            MatchMode::Literal => Compiled::Literal(patterns.to_vec()),
            MatchMode::Glob | MatchMode::Regex => {
                let mut regs = Vec::with_capacity(patterns.len());
                for p in patterns {
                    let src = if mode == MatchMode::Glob {
                        glob_to_regex(p)
                    } else {
                        p.clone()
                    };
                    regs.push(Regex::new(&src).map_err(|e| PatternError::Bad {
                        pattern: p.clone(),
                        reason:  e.to_string(),
                    })?);
                }
                Compiled::Regex(regs)
            }
        };
        Ok(Matcher(Some(compiled)))
    }

    pub fn matches(&self, name: &str) -> bool {
        match &self.0 {
            None => true,
            Some(Compiled::Literal(lits)) => lits.iter().any(|l| l == name),
            Some(Compiled::Regex(regs)) => regs.iter().any(|r| r.is_match(name)),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
