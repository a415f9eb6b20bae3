// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process trees: a parent plus every live descendant.
//!
//! Children enumeration is best-effort; processes that vanish mid-walk are
//! simply skipped.

use std::collections::HashSet;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Aggregated metrics across one tree.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TreeMetrics {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    pub read_bytes: u64,
    pub written_bytes: u64,
    /// Summed EWMA CPU percent, if a [`crate::CpuHistory`] supplied it.
    pub cpu_percent: f32,
}

/// A parent pid and its de-duplicated descendant set.
#[derive(Debug, Clone)]
pub struct ProcessTree {
    pids: Vec<u32>,
}

impl ProcessTree {
    /// Walk descendants of `root_pid`, de-duplicating by pid.
    pub fn collect(system: &System, root_pid: u32) -> Self {
        let mut seen: HashSet<u32> = HashSet::new();
        let mut stack = vec![root_pid];
        while let Some(pid) = stack.pop() {
            if !seen.insert(pid) {
                continue;
            }
            for (child_pid, proc_) in system.processes() {
                if proc_.parent() == Some(Pid::from_u32(pid)) {
                    stack.push(child_pid.as_u32());
                }
            }
        }
        let mut pids: Vec<u32> = seen.into_iter().collect();
        pids.sort_unstable();
        Self { pids }
    }

    /// Refresh process info and collect in one step.
    pub fn snapshot(root_pid: u32) -> Self {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        Self::collect(&system, root_pid)
    }

    pub fn pids(&self) -> &[u32] {
        &self.pids
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    /// Kill every member. Missing processes are ignored.
    pub fn kill(&self, system: &System) -> usize {
        let mut killed = 0;
        for pid in &self.pids {
            if let Some(proc_) = system.process(Pid::from_u32(*pid)) {
                if proc_.kill() {
                    killed += 1;
                }
            }
        }
        killed
    }

    /// Aggregate memory and I/O across the tree.
    pub fn metrics(&self, system: &System, cpu: Option<&crate::CpuHistory>) -> TreeMetrics {
        let mut total = TreeMetrics::default();
        for pid in &self.pids {
            let Some(proc_) = system.process(Pid::from_u32(*pid)) else {
                continue;
            };
            total.rss_bytes += proc_.memory();
            total.virtual_bytes += proc_.virtual_memory();
            let disk = proc_.disk_usage();
            total.read_bytes += disk.total_read_bytes;
            total.written_bytes += disk.total_written_bytes;
            if let Some(cpu) = cpu {
                total.cpu_percent += cpu.percent(*pid);
            }
        }
        total
    }
}
