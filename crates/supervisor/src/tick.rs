// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-service supervisor tick.
//!
//! Fires every second and runs a small state machine over the process
//! list: prune the dead, keep at least one live instance, enforce the
//! memory ceiling, scale toward `cluster_min`, then let the autoscaler
//! vote between `cluster_min` and `cluster_max`.

use crate::proc::{ProcCluster, ProcessState};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const TICK_EVERY: Duration = Duration::from_secs(1);

/// CPU vote of one process in one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Vote {
    Up,
    Down,
    Neutral,
}

impl ProcCluster {
    /// Start the 1 s ticker; stops when the cluster context cancels.
    pub fn spawn_ticker(self: &Arc<Self>) {
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TICK_EVERY);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cluster.cancel_token().cancelled() => return,
                    _ = tick.tick() => {}
                }
                cluster.tick().await;
            }
        });
    }

    /// One pass of the state machine.
    pub async fn tick(self: &Arc<Self>) {
        // 1. Prune dead processes.
        let mut live: Vec<Arc<ProcessState>> = Vec::new();
        for proc_ in self.processes() {
            if proc_.alive().await {
                live.push(proc_);
            } else {
                self.lb.remove(&proc_.upstream);
                self.procs.lock().retain(|p| !Arc::ptr_eq(p, &proc_));
                debug!(service = %self.name, pid = proc_.pid, "pruned dead instance");
            }
        }

        let active: Vec<&Arc<ProcessState>> =
            live.iter().filter(|p| !p.terminating()).collect();

        // 2. Nothing live and nothing mid-termination: restart from zero.
        if active.is_empty() {
            if live.is_empty() {
                if let Err(err) = self.spawn_one().await {
                    warn!(service = %self.name, %err, "respawn failed; will retry next tick");
                }
            }
            return;
        }

        // 3. Memory ceiling.
        if let Some(max_memory) = self.spec.max_memory {
            for proc_ in &active {
                let rss = self.cpu.rss(proc_.pid);
                if rss > max_memory {
                    warn!(service = %self.name, pid = proc_.pid, rss, max_memory, "memory ceiling exceeded");
                    let cluster = Arc::clone(self);
                    let state = Arc::clone(proc_);
                    tokio::spawn(async move { cluster.remove_and_terminate(&state).await });
                }
            }
        }

        // 4. Scale to cluster_min; slow start spawns one per tick.
        let mut count = active.len() as u32;
        while count < self.cluster_min {
            match self.spawn_one().await {
                Ok(_) => count += 1,
                Err(err) => {
                    warn!(service = %self.name, %err, "scale-up spawn failed");
                    break;
                }
            }
            if self.spec.slow_start {
                break;
            }
        }

        // 5. Autoscale between min and max.
        if let Some(autoscale) = self.spec.autoscale.clone() {
            self.autoscale_tick(&autoscale).await;
        }
    }

    async fn autoscale_tick(self: &Arc<Self>, auto: &pm3_manifest::AutoScaleSpec) {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let eligible: Vec<Arc<ProcessState>> = self
            .processes()
            .into_iter()
            .filter(|p| !p.terminating())
            .filter(|p| now_ms.saturating_sub(p.started_ms) >= auto.defer.as_millis() as u64)
            .collect();
        if eligible.is_empty() {
            return;
        }

        self.cpu.sample(&eligible.iter().map(|p| p.pid).collect::<Vec<_>>());

        let votes: Vec<Vote> = eligible
            .iter()
            .map(|p| classify(self.cpu.percent(p.pid), auto))
            .collect();

        // Fold votes into the streak counters.
        for (proc_, vote) in eligible.iter().zip(&votes) {
            if *vote == Vote::Down {
                proc_.down_ticks.fetch_add(1, Ordering::Relaxed);
            } else {
                proc_.down_ticks.store(0, Ordering::Relaxed);
            }
        }

        let total = self.processes().iter().filter(|p| !p.terminating()).count() as u32;
        let down_streaks: Vec<u32> = eligible
            .iter()
            .map(|p| p.down_ticks.load(Ordering::Relaxed))
            .collect();
        let up_ticks = self.up_ticks.load(Ordering::Relaxed);

        let (decision, new_up_ticks) = decide(
            &votes,
            &down_streaks,
            total,
            self.cluster_min,
            self.cluster_max,
            auto.streak,
            up_ticks,
        );
        self.up_ticks.store(new_up_ticks, Ordering::Relaxed);

        match decision {
            ScaleDecision::Hold => {}
            ScaleDecision::Up => {
                debug!(service = %self.name, total, "autoscale up");
                if let Err(err) = self.spawn_one().await {
                    warn!(service = %self.name, %err, "autoscale spawn failed");
                }
            }
            ScaleDecision::Down(index) => {
                let victim = Arc::clone(&eligible[index]);
                debug!(service = %self.name, pid = victim.pid, "autoscale down");
                let cluster = Arc::clone(self);
                tokio::spawn(async move { cluster.remove_and_terminate(&victim).await });
            }
        }
    }
}

fn classify(cpu: f32, auto: &pm3_manifest::AutoScaleSpec) -> Vote {
    if cpu > auto.upscale_percent {
        Vote::Up
    } else if cpu < auto.downscale_percent {
        Vote::Down
    } else {
        Vote::Neutral
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScaleDecision {
    Up,
    /// Index into the eligible list.
    Down(usize),
    Hold,
}

/// The pure autoscale rule.
///
/// Up: while every process is at-or-above the downscale line and the
/// majority votes up, a global counter accumulates; at `streak` it spawns
/// (capped at max). Down: when down votes dominate and the cluster is
/// above min, the first process whose personal streak crossed the
/// threshold is terminated.
pub(crate) fn decide(
    votes: &[Vote],
    down_streaks: &[u32],
    total: u32,
    min: u32,
    max: u32,
    streak: u32,
    up_ticks: u32,
) -> (ScaleDecision, u32) {
    let ups = votes.iter().filter(|v| **v == Vote::Up).count();
    let downs = votes.iter().filter(|v| **v == Vote::Down).count();
    let none_below = votes.iter().all(|v| *v != Vote::Down);

    if none_below && ups * 2 > votes.len() {
        let accumulated = up_ticks + 1;
        if accumulated >= streak && total < max {
            return (ScaleDecision::Up, 0);
        }
        return (ScaleDecision::Hold, accumulated);
    }

    if downs * 2 > votes.len() && total > min {
        if let Some(index) = down_streaks.iter().position(|s| *s >= streak) {
            return (ScaleDecision::Down(index), 0);
        }
    }
    (ScaleDecision::Hold, 0)
}

#[cfg(test)]
#[path = "tick_tests.rs"]
mod tests;
