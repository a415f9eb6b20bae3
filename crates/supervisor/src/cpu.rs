// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-pid CPU history.
//!
//! sysinfo's instantaneous cpu_usage is noisy between refreshes; the
//! autoscaler wants a smoothed signal. One EWMA per pid, refreshed on the
//! supervisor tick.

use parking_lot::Mutex;
use std::collections::HashMap;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// EWMA smoothing factor per 1 s sample.
const ALPHA: f32 = 0.3;

#[derive(Default)]
pub struct CpuHistory {
    system: Mutex<System>,
    ewma: Mutex<HashMap<u32, f32>>,
}

impl CpuHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample every tracked pid and fold into the EWMAs.
    pub fn sample(&self, pids: &[u32]) {
        let mut system = self.system.lock();
        let targets: Vec<Pid> = pids.iter().map(|p| Pid::from_u32(*p)).collect();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&targets),
            true,
            ProcessRefreshKind::nothing().with_cpu(),
        );

        let mut ewma = self.ewma.lock();
        ewma.retain(|pid, _| pids.contains(pid));
        for pid in pids {
            let usage = system
                .process(Pid::from_u32(*pid))
                .map(|p| p.cpu_usage())
                .unwrap_or(0.0);
            let entry = ewma.entry(*pid).or_insert(usage);
            *entry = *entry * (1.0 - ALPHA) + usage * ALPHA;
        }
    }

    /// Smoothed CPU percent for one pid (0 when never sampled).
    pub fn percent(&self, pid: u32) -> f32 {
        self.ewma.lock().get(&pid).copied().unwrap_or(0.0)
    }

    /// Direct override, for tests driving the autoscaler.
    #[cfg(any(test, feature = "test-support"))]
    pub fn set_percent(&self, pid: u32, value: f32) {
        self.ewma.lock().insert(pid, value);
    }

    /// Resident set size of one pid, refreshed on demand.
    pub fn rss(&self, pid: u32) -> u64 {
        let mut system = self.system.lock();
        let target = [Pid::from_u32(pid)];
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&target),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(Pid::from_u32(pid)).map(|p| p.memory()).unwrap_or(0)
    }
}
