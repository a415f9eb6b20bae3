// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rate-limit specification.
//!
//! The manifest writes limits as `<count>/<period>` with an optional
//! `block <duration>` suffix, e.g. `10/1s`, `100/1m block 5m`. The period
//! uses humantime syntax.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Parsed rate-limit spec: `count` requests per `period`, with an optional
/// block applied once the limit is exceeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub count: u64,
    pub period: Duration,
    pub block: Option<Duration>,
}

#[derive(Debug, Error, PartialEq)]
pub enum LimitError {
    #[error("limit must look like '<count>/<period>[ block <duration>]', got {0:?}")]
    Malformed(String),

    #[error("invalid count in limit {0:?}")]
    BadCount(String),

    #[error("invalid duration in limit {0:?}: {1}")]
    BadDuration(String, String),

    #[error("limit count must be at least 1")]
    ZeroCount,

    #[error("limit period must be non-zero")]
    ZeroPeriod,
}

impl RateLimit {
    pub fn new(count: u64, period: Duration) -> Self {
        Self { count, period, block: None }
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = Some(block);
        self
    }
}

impl FromStr for RateLimit {
    type Err = LimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (head, block) = match s.split_once(" block ") {
            Some((head, rest)) => {
                let block = humantime::parse_duration(rest.trim())
                    .map_err(|e| LimitError::BadDuration(s.to_string(), e.to_string()))?;
                (head.trim(), Some(block))
            }
            None => (s, None),
        };

        let (count, period) = head
            .split_once('/')
            .ok_or_else(|| LimitError::Malformed(s.to_string()))?;
        let count: u64 = count
            .trim()
            .parse()
            .map_err(|_| LimitError::BadCount(s.to_string()))?;
        let period = humantime::parse_duration(period.trim())
            .map_err(|e| LimitError::BadDuration(s.to_string(), e.to_string()))?;

        if count == 0 {
            return Err(LimitError::ZeroCount);
        }
        if period.is_zero() {
            return Err(LimitError::ZeroPeriod);
        }

        Ok(Self { count, period, block })
    }
}

impl std::fmt::Display for RateLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.count, humantime::format_duration(self.period))?;
        if let Some(block) = self.block {
            write!(f, " block {}", humantime::format_duration(block))?;
        }
        Ok(())
    }
}

impl Serialize for RateLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RateLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[path = "limit_tests.rs"]
mod tests;
