// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Service declarations.
//!
//! Every variant lowers to the generic command-runner shape ([`ProcSpec`])
//! at `prepare` time; the language wrappers only fill in `build`/`run`.
//! The supervisor never sees a wrapper.

use crate::ManifestError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_ready_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_unhealthy_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_index() -> String {
    "index.html".to_string()
}

/// Cluster size: a fixed count or a percentage of logical CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterSize {
    Fixed(u32),
    Percent(u32),
}

impl ClusterSize {
    /// Resolve to a concrete instance count, never below 1.
    pub fn resolve(&self, cpus: u32) -> u32 {
        match self {
            Self::Fixed(n) => (*n).max(1),
            Self::Percent(pct) => ((cpus * pct) / 100).max(1),
        }
    }
}

impl Serialize for ClusterSize {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Fixed(n) => serializer.serialize_u32(*n),
            Self::Percent(pct) => serializer.serialize_str(&format!("{pct}%")),
        }
    }
}

impl<'de> Deserialize<'de> for ClusterSize {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u32),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(Self::Fixed(n)),
            Raw::Text(s) => {
                let s = s.trim();
                let pct = s
                    .strip_suffix('%')
                    .ok_or_else(|| serde::de::Error::custom(format!("bad cluster size {s:?}")))?;
                let pct: u32 = pct
                    .trim()
                    .parse()
                    .map_err(|_| serde::de::Error::custom(format!("bad cluster percent {s:?}")))?;
                Ok(Self::Percent(pct))
            }
        }
    }
}

/// `cluster: 2` or `cluster: { min: 1, max: 50% }`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClusterRange {
    Single(ClusterSize),
    Range { min: ClusterSize, max: ClusterSize },
}

impl Default for ClusterRange {
    fn default() -> Self {
        Self::Single(ClusterSize::Fixed(1))
    }
}

impl ClusterRange {
    pub fn resolve(&self, cpus: u32) -> (u32, u32) {
        match self {
            Self::Single(size) => {
                let n = size.resolve(cpus);
                (n, n)
            }
            Self::Range { min, max } => (min.resolve(cpus), max.resolve(cpus)),
        }
    }
}

/// Autoscaling thresholds. Present means enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutoScaleSpec {
    /// CPU % above which a process votes to scale up.
    pub upscale_percent: f32,
    /// CPU % below which a process votes to scale down.
    pub downscale_percent: f32,
    /// Consecutive ticks a vote must hold before acting.
    pub streak: u32,
    /// Ignore processes younger than this.
    #[serde(with = "humantime_serde")]
    pub defer: Duration,
}

impl Default for AutoScaleSpec {
    fn default() -> Self {
        Self {
            upscale_percent: 80.0,
            downscale_percent: 20.0,
            streak: 5,
            defer: Duration::from_secs(30),
        }
    }
}

/// Optional per-status-class hook applied by the service's balancer:
/// rate-limit the offending client, replace the body, or override
/// retriability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusPolicySpec {
    pub limit: Option<pm3_core::RateLimit>,
    pub body: Option<String>,
    pub retry: Option<bool>,
}

pub(crate) const STRATEGIES: &[&str] = &["least-conn", "random", "hash", "round-robin"];

/// The generic command-runner service shape everything lowers into.
// deny_unknown_fields is off because WrapperSpec flattens this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcSpec {
    /// Service root directory (resolved to absolute by the reconciler).
    pub root: PathBuf,
    /// Ordered build commands, run through `sh -c`.
    pub build: Vec<String>,
    /// Run command. Empty means the service is passive.
    pub run: String,
    /// Optional shutdown commands run after the process stops.
    pub shutdown: Vec<String>,
    /// Instance count or range.
    pub cluster: ClusterRange,
    /// Extra environment merged over the node env.
    pub env: IndexMap<String, String>,
    /// Env var receiving the upstream host.
    pub host_env: Option<String>,
    /// Env var receiving the upstream port.
    pub port_env: Option<String>,
    /// Env var receiving `host:port`.
    pub listen_env: Option<String>,
    /// How long to wait for the first healthy probe.
    #[serde(with = "humantime_serde", default = "default_ready_timeout")]
    pub ready_timeout: Duration,
    /// Grace between interrupt and kill.
    #[serde(with = "humantime_serde", default = "default_stop_timeout")]
    pub stop_timeout: Duration,
    /// Continuous unhealthy span that triggers termination.
    #[serde(with = "humantime_serde", default = "default_unhealthy_timeout")]
    pub unhealthy_timeout: Duration,
    /// RSS ceiling in bytes; exceeded processes are terminated.
    pub max_memory: Option<u64>,
    /// Autoscaling thresholds; absent disables autoscaling.
    pub autoscale: Option<AutoScaleSpec>,
    /// Spawn at most one instance per tick while scaling to min.
    pub slow_start: bool,
    /// Per-service log file name (defaults to `<name>.log`).
    pub log: Option<String>,
    /// Balancing strategy (`least-conn` when unset).
    pub strategy: Option<String>,
    /// Pin clients to their last good upstream.
    pub sticky: bool,
    /// Balancer status hooks.
    pub on_404: Option<StatusPolicySpec>,
    pub on_4xx: Option<StatusPolicySpec>,
    pub on_5xx: Option<StatusPolicySpec>,
}

impl Default for ProcSpec {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            build: Vec::new(),
            run: String::new(),
            shutdown: Vec::new(),
            cluster: ClusterRange::default(),
            env: IndexMap::new(),
            host_env: None,
            port_env: None,
            listen_env: None,
            ready_timeout: default_ready_timeout(),
            stop_timeout: default_stop_timeout(),
            unhealthy_timeout: default_unhealthy_timeout(),
            max_memory: None,
            autoscale: None,
            slow_start: false,
            log: None,
            strategy: None,
            sticky: false,
            on_404: None,
            on_4xx: None,
            on_5xx: None,
        }
    }
}

/// In-memory file server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileServerSpec {
    pub root: PathBuf,
    /// Optional regex restricting which files load.
    pub filter: Option<String>,
    /// Directory index file.
    #[serde(default = "default_index")]
    pub index: String,
    /// File served for misses instead of the plain 404 page.
    pub not_found: Option<String>,
    /// Serve `immutable/`-prefixed paths with a year-long cache header.
    pub immutable: bool,
}

impl Default for FileServerSpec {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            filter: None,
            index: default_index(),
            not_found: None,
            immutable: false,
        }
    }
}

/// A user-declared service. Tagged in YAML (`!Proc`, `!FileServer`, `!Js`,
/// ...); wrappers lower to [`ProcSpec`] in [`ServiceSpec::prepare`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServiceSpec {
    FileServer(FileServerSpec),
    Proc(ProcSpec),
    /// `node <main>` with npm installs.
    Js(WrapperSpec),
    /// `npm start` style packages.
    Npm(WrapperSpec),
    /// `python <main>` with optional requirements install.
    Python(WrapperSpec),
    /// Flask app run through `flask run`.
    Flask(WrapperSpec),
    /// Go module built with `go build`.
    Go(WrapperSpec),
}

/// Shared shape for the language wrappers: a thin overlay on ProcSpec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WrapperSpec {
    pub root: PathBuf,
    /// Entry point (wrapper-specific default applies).
    pub main: Option<String>,
    #[serde(flatten)]
    pub proc: ProcSpec,
}

impl ServiceSpec {
    /// Lower wrappers into the generic shape and fill wrapper defaults.
    /// Called once right after parse, keyed by the service name.
    pub fn prepare(&mut self, name: &str) -> Result<(), ManifestError> {
        let lowered = match self {
            Self::FileServer(_) | Self::Proc(_) => return Ok(()),
            Self::Js(w) => {
                let main = w.main.clone().unwrap_or_else(|| "index.js".into());
                Self::lower(w, vec!["npm install".into()], format!("node {main}"))
            }
            Self::Npm(w) => Self::lower(w, vec!["npm install".into()], "npm start".into()),
            Self::Python(w) => {
                let main = w.main.clone().unwrap_or_else(|| "main.py".into());
                let build = if w.root.join("requirements.txt").exists() {
                    vec!["pip install -r requirements.txt".into()]
                } else {
                    vec![]
                };
                Self::lower(w, build, format!("python {main}"))
            }
            Self::Flask(w) => Self::lower(
                w,
                vec!["pip install -r requirements.txt".into()],
                "flask run --host $HOST --port $PORT".into(),
            ),
            Self::Go(w) => {
                let out = format!("./.pm3-{name}");
                Self::lower(w, vec![format!("go build -o {out} .")], out)
            }
        };
        *self = Self::Proc(lowered);
        Ok(())
    }

    fn lower(w: &WrapperSpec, build: Vec<String>, run: String) -> ProcSpec {
        let mut proc = w.proc.clone();
        proc.root = w.root.clone();
        if proc.build.is_empty() {
            proc.build = build;
        }
        if proc.run.is_empty() {
            proc.run = run;
        }
        proc
    }

    pub fn root(&self) -> &PathBuf {
        match self {
            Self::FileServer(fs) => &fs.root,
            Self::Proc(p) => &p.root,
            Self::Js(w) | Self::Npm(w) | Self::Python(w) | Self::Flask(w) | Self::Go(w) => &w.root,
        }
    }

    pub fn set_root(&mut self, root: PathBuf) {
        match self {
            Self::FileServer(fs) => fs.root = root,
            Self::Proc(p) => p.root = root,
            Self::Js(w) | Self::Npm(w) | Self::Python(w) | Self::Flask(w) | Self::Go(w) => {
                w.root = root
            }
        }
    }

    /// Identity bytes used by the reconciler to decide replace-vs-keep.
    pub fn identity(&self) -> Vec<u8> {
        // Serialization is infallible for these plain data types.
        serde_yaml::to_string(self).unwrap_or_default().into_bytes()
    }

    pub fn validate(&self, name: &str) -> Result<(), ManifestError> {
        if let Self::Proc(proc) = self {
            // Percent sizes resolve per-host; validate against this host's CPUs.
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1);
            let (min, max) = proc.cluster.resolve(cpus);
            if max < min || min < 1 {
                return Err(ManifestError::BadClusterRange {
                    name: name.to_string(),
                    min,
                    max,
                });
            }
            if let Some(strategy) = &proc.strategy {
                if !STRATEGIES.contains(&strategy.as_str()) {
                    return Err(ManifestError::BadService {
                        name: name.to_string(),
                        reason: format!("unknown strategy {strategy:?} (expected one of {STRATEGIES:?})"),
                    });
                }
            }
        }
        if let Self::FileServer(fs) = self {
            if let Some(filter) = &fs.filter {
                regex::Regex::new(filter).map_err(|e| ManifestError::BadService {
                    name: name.to_string(),
                    reason: format!("bad filter regex: {e}"),
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
