// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Declarative manifest for a pm3 node.
//!
//! The manifest enumerates services, virtual hosts, message runners, broker
//! declarations, and node options. Parsing is strict serde over YAML; the
//! templating preprocessor runs before this crate ever sees the bytes.
//!
//! Service declaration order is preserved (services start in the order the
//! user wrote them), hence `IndexMap` throughout.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod runner;
mod service;
mod vhost;

pub use runner::{RetrySpec, RunnerSpec, ScheduleEntry};
pub use service::{
    AutoScaleSpec, ClusterRange, ClusterSize, FileServerSpec, ProcSpec, ServiceSpec,
    StatusPolicySpec,
};
pub use vhost::{CertSource, VhostSpec};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("service {name}: cluster range requires max >= min >= 1 (got {min}..{max})")]
    BadClusterRange { name: String, min: u32, max: u32 },

    #[error("service {name}: root directory {root} does not exist")]
    MissingRoot { name: String, root: PathBuf },

    #[error("service {name}: {reason}")]
    BadService { name: String, reason: String },
}

/// Network surface of the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSpec {
    /// Bind address for both listeners.
    pub bind: String,
    /// Plain HTTP port.
    pub http: u16,
    /// TLS port.
    pub https: u16,
    /// Host-pattern -> virtual host.
    pub hosts: IndexMap<String, VhostSpec>,
    /// Custom error templates keyed by code. `{code}`, `{title}`,
    /// `{explanation}`, `{solution}`, `{host}`, `{ray}`, `{ip}` substitute.
    pub error_pages: IndexMap<u16, String>,
}

impl Default for ServerSpec {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            http: 80,
            https: 443,
            hosts: IndexMap::new(),
            error_pages: IndexMap::new(),
        }
    }
}

/// Durable-stream / KV / object-store declarations initialized on reload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JetSpec {
    pub streams: Vec<String>,
    pub kv: Vec<String>,
    pub obj: Vec<String>,
}

/// IP-info provider options. The lookups themselves are external; these
/// options only select which providers the stack installs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct IpInfoOptions {
    /// Path to a Maxmind database consumed by an external provider.
    pub maxmind: Option<PathBuf>,
    /// Path to a newline-separated list of marked CIDRs.
    pub markers: Option<PathBuf>,
}

/// Top-level manifest. Immutable once parsed; reloads parse a fresh one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Manifest {
    pub server: ServerSpec,
    pub services: IndexMap<String, ServiceSpec>,
    pub runners: IndexMap<String, RunnerSpec>,
    pub jet: JetSpec,
    pub env: IndexMap<String, String>,
    pub ipinfo: IpInfoOptions,
}

impl Manifest {
    /// Parse a manifest from YAML text.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut manifest: Manifest = serde_yaml::from_str(text)?;
        for (name, spec) in &mut manifest.services {
            spec.prepare(name)?;
        }
        for (subject, runner) in &mut manifest.runners {
            runner.subject = subject.clone();
        }
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text =
            std::fs::read_to_string(path).map_err(|e| ManifestError::Read(path.into(), e))?;
        Self::parse(&text)
    }

    /// Resolve every service root against `base`, requiring each to exist.
    pub fn resolve_roots(&mut self, base: &Path) -> Result<(), ManifestError> {
        for (name, spec) in &mut self.services {
            let root = spec.root();
            let abs = if root.is_absolute() { root.clone() } else { base.join(root) };
            let abs = abs.canonicalize().map_err(|_| ManifestError::MissingRoot {
                name: name.clone(),
                root: abs.clone(),
            })?;
            spec.set_root(abs);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ManifestError> {
        for (name, spec) in &self.services {
            spec.validate(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "manifest_tests.rs"]
mod tests;
