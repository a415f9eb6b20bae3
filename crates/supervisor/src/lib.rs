// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Service supervision.
//!
//! One [`ServiceState`] per manifest service. A service is an in-memory
//! file server, a process cluster (built, spawned, health-gated, scaled,
//! drained), or passive. The build cache, process tree, rotating logs, and
//! the orphan reaper live here too.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod addr;
mod buildfs;
mod cpu;
mod fileserver;
mod hashdir;
mod instance;
mod logs;
mod proc;
mod proctree;
mod reaper;
mod tick;

pub use addr::AddrAllocator;
pub use buildfs::{BuildFs, BuildFsError};
pub use cpu::CpuHistory;
pub use fileserver::FileServer;
pub use hashdir::hash_service_root;
pub use instance::{ServiceInstance, ServiceState, StartDeps, SupervisorError};
pub use logs::ServiceLog;
pub use proc::{ProcCluster, ProcessState};
pub use proctree::ProcessTree;
pub use reaper::{NullTracker, OrphanReaper, ReapMode, SpawnTracker, TrackerFile};

/// Environment tag inherited by every spawned process.
pub const ENV_TAG: &str = "PM3G";
/// Service name exported to children.
pub const ENV_SERVICE: &str = "PM3_SERVICE";
/// Run id exported to children.
pub const ENV_RUN_ID: &str = "PM3_RUN_ID";
