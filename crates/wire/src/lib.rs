// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! RPC payload types for the `pm3` reserved host.
//!
//! Pure serde data shared by the daemon and its clients; the transport is
//! plain HTTP routed by pseudo-paths.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `POST /reload` and `POST /service/restart` body.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReloadParams {
    pub invalidate: bool,
}

/// `GET /service` response: name -> run id.
pub type ServiceList = BTreeMap<String, String>;

/// One instance in a health report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceHealth {
    pub pid: u32,
    pub addr: String,
    pub healthy: bool,
    pub terminating: bool,
}

/// `GET /service/health/<name>` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceHealth {
    pub name: String,
    pub healthy: bool,
    pub instances: Vec<InstanceHealth>,
}

/// `GET /service/metrics/<name>` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceMetrics {
    pub name: String,
    pub instances: usize,
    pub rss_bytes: u64,
    pub cpu_percent: f32,
    pub requests: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub errors: u64,
}

/// `GET /service/info/<name>` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub run_id: String,
    pub kind: String,
    pub handler: String,
    pub start_error: Option<String>,
}

/// `GET /peers` response entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub machine_id: String,
    pub alive: bool,
}

/// `POST /kv/<key>/cas` body: JSON-equality compare and swap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KvCas {
    pub expected: serde_json::Value,
    pub desired: serde_json::Value,
}

/// `POST /tail` body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TailOptions {
    pub service: String,
    #[serde(default = "default_tail_lines")]
    pub lines: usize,
}

fn default_tail_lines() -> usize {
    100
}

/// `GET /system` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemReport {
    pub cpus: usize,
    pub memory_total: u64,
    pub memory_used: u64,
    pub load_one: f64,
    pub uptime_secs: u64,
}

/// `GET /session` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionReport {
    pub tracked_sessions: usize,
    pub services: usize,
    pub runners: usize,
}
