// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host+path pattern matching.
//!
//! Patterns match against the concatenation `host + path`. Precedence
//! inside a pipeline is list order, never specificity; a pattern is a pure
//! function of `(host, path)`.
//!
//! Syntax:
//! - empty or `_` — wildcard
//! - `prefix/` or `prefix+` — prefix match
//! - `+suffix` — suffix match
//! - `~regex` — anchored regex
//! - `a, b, c` — alternation (first match wins)
//! - anything else — exact literal

use regex::Regex;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("bad pattern regex {0:?}: {1}")]
    BadRegex(String, #[source] regex::Error),
}

#[derive(Debug, Clone)]
pub enum Pattern {
    Wildcard,
    Exact(String),
    Prefix(String),
    Suffix(String),
    Regex(Regex),
    Any(Vec<Pattern>),
}

impl Pattern {
    pub fn parse(text: &str) -> Result<Self, PatternError> {
        let text = text.trim();
        if text.is_empty() || text == "_" {
            return Ok(Self::Wildcard);
        }
        if text.contains(',') {
            let alts = text
                .split(',')
                .map(|part| Self::parse(part))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Self::Any(alts));
        }
        if let Some(re) = text.strip_prefix('~') {
            let anchored = format!("^(?:{re})$");
            let re = Regex::new(&anchored).map_err(|e| PatternError::BadRegex(text.into(), e))?;
            return Ok(Self::Regex(re));
        }
        if let Some(prefix) = text.strip_suffix('+') {
            return Ok(Self::Prefix(prefix.to_string()));
        }
        if text.ends_with('/') {
            return Ok(Self::Prefix(text.to_string()));
        }
        if let Some(suffix) = text.strip_prefix('+') {
            return Ok(Self::Suffix(suffix.to_string()));
        }
        Ok(Self::Exact(text.to_string()))
    }

    /// Match against `host + path`.
    pub fn matches(&self, host: &str, path: &str) -> bool {
        let target = format!("{host}{path}");
        self.matches_str(&target)
    }

    fn matches_str(&self, target: &str) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Exact(lit) => target == lit,
            Self::Prefix(prefix) => target.starts_with(prefix.as_str()),
            Self::Suffix(suffix) => target.ends_with(suffix.as_str()),
            Self::Regex(re) => re.is_match(target),
            Self::Any(alts) => alts.iter().any(|p| p.matches_str(target)),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wildcard => write!(f, "_"),
            Self::Exact(lit) => write!(f, "{lit}"),
            // `p/` already reads as a prefix; only bare stems need the `+`.
            Self::Prefix(p) if p.ends_with('/') => write!(f, "{p}"),
            Self::Prefix(p) => write!(f, "{p}+"),
            Self::Suffix(s) => write!(f, "+{s}"),
            Self::Regex(re) => {
                let raw = re
                    .as_str()
                    .strip_prefix("^(?:")
                    .and_then(|s| s.strip_suffix(")$"))
                    .unwrap_or(re.as_str());
                write!(f, "~{raw}")
            }
            Self::Any(alts) => {
                let parts: Vec<String> = alts.iter().map(|p| p.to_string()).collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Wildcard, Self::Wildcard) => true,
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Prefix(a), Self::Prefix(b)) => a == b,
            (Self::Suffix(a), Self::Suffix(b)) => a == b,
            (Self::Regex(a), Self::Regex(b)) => a.as_str() == b.as_str(),
            (Self::Any(a), Self::Any(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
#[path = "pattern_tests.rs"]
mod tests;
