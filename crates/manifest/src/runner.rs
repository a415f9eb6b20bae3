// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Message-runner and schedule declarations.

use pm3_core::RateLimit;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_attempts() -> u32 {
    3
}

fn default_step() -> Duration {
    Duration::from_secs(5)
}

/// Retry policy for 5xx handler results (and proxy upstream errors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySpec {
    /// Total delivery attempts before the message is terminated.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Delay between redeliveries.
    #[serde(with = "humantime_serde", default = "default_step")]
    pub step: Duration,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self { attempts: default_attempts(), step: default_step() }
    }
}

impl RetrySpec {
    /// Whether a delivery numbered `attempt` (1-based) may be retried.
    pub fn retryable(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }
}

/// A distributed scheduled publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleEntry {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Explicit topic; defaults to the runner's subject.
    #[serde(default)]
    pub topic: Option<String>,
    /// Payload published each interval.
    #[serde(default)]
    pub payload: Option<String>,
}

/// One runner: a broker subject bound to a handler pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerSpec {
    /// Subject pattern (injected from the map key).
    #[serde(skip)]
    pub subject: String,
    /// Leading subject tokens dropped when synthesizing request paths.
    /// Set internally for the implicit `svc.<name>.>` runners.
    #[serde(skip)]
    pub strip_tokens: usize,
    /// Handler pipeline, raw nodes for the proxy registry.
    pub handlers: Vec<serde_yaml::Value>,
    /// Consume at most `count` messages per `period` (switches to pull mode).
    pub rate: Option<RateLimit>,
    /// Retry policy for 5xx results.
    pub retry: RetrySpec,
    /// Store 2xx bodies under `<stream>-<seq>` in the results bucket.
    pub store_results: bool,
    /// Scheduled publishers feeding this subject.
    pub schedule: Vec<ScheduleEntry>,
}
