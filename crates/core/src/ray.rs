// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ray and run id generation.
//!
//! A ray id traces one inbound request through logs, error pages and the
//! `P-Ray` response header. A run id identifies one generation of a service
//! between manifest reloads.

use serde::{Deserialize, Serialize};

/// Lowercase hex alphabet; ray ids read like trace fragments, not words.
const HEX: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

/// Per-request trace identifier. 16 hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RayId(String);

impl RayId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RayId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Generate a fresh ray id.
pub fn new_ray_id() -> RayId {
    RayId(nanoid::nanoid!(16, &HEX))
}

/// Generate a fresh service run id (prefixed so logs are greppable).
pub fn new_run_id() -> String {
    format!("run-{}", nanoid::nanoid!(12, &HEX))
}

#[cfg(test)]
#[path = "ray_tests.rs"]
mod tests;
