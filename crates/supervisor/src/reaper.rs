// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Orphan reaping across daemon restarts.
//!
//! A daemon killed with SIGKILL leaves its service processes running. On
//! the next startup they are found and killed, tree-inclusive, before any
//! service starts. Two modes, probed at startup:
//!
//! - env-tag: every spawned process inherits `PM3G=1`; scan all processes
//!   for the tag and kill any whose parent is not this daemon.
//! - tracker-file: a fixed-width append-only record file
//!   `(pid, ppid, start_ms)`; used where other processes' environments
//!   cannot be read.

use crate::proctree::ProcessTree;
use crate::ENV_TAG;
use parking_lot::Mutex;
use std::io::{Read, Seek, Write};
use std::path::PathBuf;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{info, warn};

/// Hook the cluster calls on every spawn so the tracker file stays
/// current. The env-tag mode needs nothing recorded.
pub trait SpawnTracker: Send + Sync {
    fn record_spawn(&self, pid: u32, ppid: u32, start_ms: u64);
}

/// Tracker for env-tag mode (and tests): records nothing.
pub struct NullTracker;

impl SpawnTracker for NullTracker {
    fn record_spawn(&self, _pid: u32, _ppid: u32, _start_ms: u64) {}
}

/// Which reaping mode the platform supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapMode {
    EnvTag,
    TrackerFile,
}

/// Probe: can we read another process's environment? Reading our own via
/// the process API is the cheapest faithful signal.
pub fn probe_mode() -> ReapMode {
    let mut system = System::new();
    let me = Pid::from_u32(std::process::id());
    system.refresh_processes(ProcessesToUpdate::Some(&[me]), true);
    let readable = system
        .process(me)
        .map(|p| !p.environ().is_empty())
        .unwrap_or(false);
    if readable {
        ReapMode::EnvTag
    } else {
        ReapMode::TrackerFile
    }
}

/// One fixed-width tracker record: `pid:10 ppid:10 start_ms:20 \n`.
const RECORD_LEN: usize = 10 + 1 + 10 + 1 + 20 + 1;

/// Append-only spawn tracker file with exclusive locking.
pub struct TrackerFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TrackerFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn open_locked(&self) -> std::io::Result<std::fs::File> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        fs2::FileExt::lock_exclusive(&file)?;
        Ok(file)
    }

    pub fn append(&self, pid: u32, ppid: u32, start_ms: u64) -> std::io::Result<()> {
        let _guard = self.lock.lock();
        let mut file = self.open_locked()?;
        file.seek(std::io::SeekFrom::End(0))?;
        write!(file, "{pid:010} {ppid:010} {start_ms:020}\n")?;
        fs2::FileExt::unlock(&file)
    }

    pub fn load(&self) -> std::io::Result<Vec<(u32, u32, u64)>> {
        let _guard = self.lock.lock();
        let mut file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        fs2::FileExt::lock_shared(&file)?;
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        fs2::FileExt::unlock(&file)?;

        Ok(text
            .as_bytes()
            .chunks(RECORD_LEN)
            .filter_map(|chunk| {
                let line = std::str::from_utf8(chunk).ok()?.trim_end();
                let mut fields = line.split_whitespace();
                let pid = fields.next()?.parse().ok()?;
                let ppid = fields.next()?.parse().ok()?;
                let start_ms = fields.next()?.parse().ok()?;
                Some((pid, ppid, start_ms))
            })
            .collect())
    }

    /// Rewrite keeping only records owned by `ppid`.
    pub fn retain_children_of(&self, ppid: u32) -> std::io::Result<()> {
        let records = self.load()?;
        let _guard = self.lock.lock();
        let mut file = self.open_locked()?;
        file.set_len(0)?;
        file.seek(std::io::SeekFrom::Start(0))?;
        for (pid, parent, start_ms) in records {
            if parent == ppid {
                write!(file, "{pid:010} {parent:010} {start_ms:020}\n")?;
            }
        }
        fs2::FileExt::unlock(&file)
    }
}

impl SpawnTracker for TrackerFile {
    fn record_spawn(&self, pid: u32, ppid: u32, start_ms: u64) {
        if let Err(err) = self.append(pid, ppid, start_ms) {
            warn!(%err, pid, "failed to record spawn in tracker");
        }
    }
}

/// The startup reaper.
pub struct OrphanReaper {
    mode: ReapMode,
    tracker: TrackerFile,
}

impl OrphanReaper {
    pub fn new(tracker_path: PathBuf) -> Self {
        Self { mode: probe_mode(), tracker: TrackerFile::new(tracker_path) }
    }

    pub fn with_mode(mode: ReapMode, tracker_path: PathBuf) -> Self {
        Self { mode, tracker: TrackerFile::new(tracker_path) }
    }

    pub fn mode(&self) -> ReapMode {
        self.mode
    }

    /// The tracker clusters should record spawns into: the tracker file in
    /// tracker mode, nothing in env-tag mode.
    pub fn spawn_tracker(self: &std::sync::Arc<Self>) -> std::sync::Arc<dyn SpawnTracker> {
        match self.mode {
            ReapMode::EnvTag => std::sync::Arc::new(NullTracker),
            ReapMode::TrackerFile => {
                std::sync::Arc::new(TrackerFile::new(self.tracker.path().clone()))
            }
        }
    }

    /// Kill every orphan left by a previous daemon. Returns killed pids.
    pub fn reap(&self, my_pid: u32) -> Vec<u32> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let victims: Vec<u32> = match self.mode {
            ReapMode::EnvTag => self.find_by_env_tag(&system, my_pid),
            ReapMode::TrackerFile => self.find_by_tracker(&system, my_pid),
        };

        let mut killed = Vec::new();
        for pid in victims {
            let tree = ProcessTree::collect(&system, pid);
            let count = tree.kill(&system);
            if count > 0 {
                info!(pid, tree = tree.len(), "reaped orphan");
                killed.push(pid);
            }
        }

        if self.mode == ReapMode::TrackerFile {
            if let Err(err) = self.tracker.retain_children_of(my_pid) {
                warn!(%err, "failed to rewrite tracker file");
            }
        }
        killed
    }

    fn find_by_env_tag(&self, system: &System, my_pid: u32) -> Vec<u32> {
        let tag = format!("{ENV_TAG}=1");
        system
            .processes()
            .iter()
            .filter(|(_, proc_)| {
                proc_
                    .environ()
                    .iter()
                    .any(|kv| kv.to_string_lossy() == tag)
            })
            .filter(|(_, proc_)| proc_.parent().map(|p| p.as_u32()) != Some(my_pid))
            .filter(|(pid, _)| pid.as_u32() != my_pid)
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }

    fn find_by_tracker(&self, system: &System, my_pid: u32) -> Vec<u32> {
        let records = match self.tracker.load() {
            Ok(records) => records,
            Err(err) => {
                warn!(%err, "failed to load tracker file");
                return Vec::new();
            }
        };
        records
            .into_iter()
            .filter(|(_, ppid, _)| *ppid != my_pid)
            .filter(|(pid, ppid, start_ms)| {
                // Verify the pid still names the same process: same parent,
                // start time within a second of the recorded one.
                let Some(proc_) = system.process(Pid::from_u32(*pid)) else {
                    return false;
                };
                let same_parent = proc_.parent().map(|p| p.as_u32()) == Some(*ppid);
                let recorded_secs = start_ms / 1000;
                let close_start = proc_.start_time().abs_diff(recorded_secs) <= 1;
                same_parent && close_start
            })
            .map(|(pid, _, _)| pid)
            .collect()
    }
}

#[cfg(test)]
#[path = "reaper_tests.rs"]
mod tests;
