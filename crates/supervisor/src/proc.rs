// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process cluster: spawn, health-gate, drain, terminate.

use crate::addr::AddrAllocator;
use crate::cpu::CpuHistory;
use crate::instance::SupervisorError;
use crate::logs::{pump, ServiceLog};
use crate::proctree::ProcessTree;
use crate::reaper::SpawnTracker;
use crate::{ENV_RUN_ID, ENV_SERVICE, ENV_TAG};
use async_trait::async_trait;
use indexmap::IndexMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;
use parking_lot::Mutex;
use pm3_core::EdgeError;
use pm3_manifest::ProcSpec;
use pm3_proxy::{Exchange, Flow, Handler, LoadBalancer, Upstream};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drain poll cadence during termination.
const DRAIN_POLL: Duration = Duration::from_millis(200);
/// Liveness poll cadence while waiting for exit.
const EXIT_POLL: Duration = Duration::from_millis(100);
/// Readiness probe cadence.
const READY_POLL: Duration = Duration::from_millis(100);
/// Continuous health observer cadence.
const OBSERVE_EVERY: Duration = Duration::from_secs(1);

fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One supervised OS process.
pub struct ProcessState {
    pub pid: u32,
    pub addr: String,
    pub upstream: Arc<Upstream>,
    pub started_ms: u64,
    /// Termination deadline, epoch ms. 0 = not terminating.
    deadline_ms: AtomicU64,
    /// At most one deadline extension per termination attempt.
    deadline_extended: AtomicBool,
    /// Exactly one interrupt per process.
    signal_sent: AtomicBool,
    /// Consecutive downscale votes.
    pub down_ticks: AtomicU32,
    dead: AtomicBool,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessState")
            .field("pid", &self.pid)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl ProcessState {
    pub fn terminating(&self) -> bool {
        self.deadline_ms.load(Ordering::Acquire) != 0
    }

    pub fn healthy(&self) -> bool {
        self.upstream.healthy() && !self.terminating()
    }

    /// Signals actually dispatched (0 or 1).
    pub fn signals_sent(&self) -> u32 {
        u32::from(self.signal_sent.load(Ordering::Acquire))
    }

    pub fn cancelled(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Dead means the child has been reaped or observed exited.
    pub async fn alive(&self) -> bool {
        if self.dead.load(Ordering::Acquire) {
            return false;
        }
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) | Err(_) => {
                    self.dead.store(true, Ordering::Release);
                    false
                }
            },
            // Stubs and reaped children carry no handle; the flag decides.
            None => !self.dead.load(Ordering::Acquire),
        }
    }

    /// Termination protocol: mark unhealthy, drain until the deadline's
    /// midpoint, send exactly one interrupt, kill the whole tree if the
    /// deadline passes. The context is cancelled only after the child has
    /// been reaped.
    pub async fn terminate(self: &Arc<Self>, stop_timeout: Duration) {
        self.upstream.set_healthy(false);

        let now = epoch_ms();
        let fresh = now + stop_timeout.as_millis() as u64;
        let deadline = match self.deadline_ms.compare_exchange(
            0,
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => fresh,
            Err(existing) => {
                // A concurrent attempt owns the protocol; extend once.
                if !self.deadline_extended.swap(true, Ordering::AcqRel) {
                    self.deadline_ms.store(fresh, Ordering::Release);
                    fresh
                } else {
                    existing
                }
            }
        };

        // Drain: wait for in-flight requests until the deadline midpoint.
        let midpoint = deadline.saturating_sub(stop_timeout.as_millis() as u64 / 2);
        while self.upstream.load_factor() > 0 && epoch_ms() < midpoint {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        if !self.signal_sent.swap(true, Ordering::AcqRel) {
            debug!(pid = self.pid, "sending interrupt");
            let _ = kill(NixPid::from_raw(self.pid as i32), Signal::SIGINT);
        }

        loop {
            if !self.alive().await {
                break;
            }
            if epoch_ms() >= deadline {
                warn!(pid = self.pid, "deadline passed; killing process tree");
                let mut system = sysinfo::System::new();
                system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
                ProcessTree::collect(&system, self.pid).kill(&system);
                break;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }

        // Reap so the pid cannot be recycled under us.
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        self.dead.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn stub(pid: u32, addr: &str, started_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            pid,
            addr: addr.to_string(),
            upstream: Upstream::new(addr),
            started_ms,
            deadline_ms: AtomicU64::new(0),
            deadline_extended: AtomicBool::new(false),
            signal_sent: AtomicBool::new(false),
            down_ticks: AtomicU32::new(0),
            dead: AtomicBool::new(false),
            child: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn stub_mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }
}

/// Poll until `addr` accepts a TCP connection or `timeout` elapses.
pub async fn wait_ready(addr: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(READY_POLL).await;
    }
}

/// A clustered process service: N supervised instances behind one
/// load balancer.
pub struct ProcCluster {
    pub name: String,
    pub spec: ProcSpec,
    pub run_id: String,
    run_dir: std::path::PathBuf,
    pub lb: Arc<LoadBalancer>,
    allocator: AddrAllocator,
    pub log: Arc<ServiceLog>,
    tracker: Arc<dyn SpawnTracker>,
    node_env: IndexMap<String, String>,
    pub(crate) procs: Mutex<Vec<Arc<ProcessState>>>,
    pub(crate) up_ticks: AtomicU32,
    pub(crate) cpu: Arc<CpuHistory>,
    pub(crate) cluster_min: u32,
    pub(crate) cluster_max: u32,
    cancel: CancellationToken,
}

impl ProcCluster {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        spec: ProcSpec,
        run_id: String,
        run_dir: std::path::PathBuf,
        lb: Arc<LoadBalancer>,
        log: Arc<ServiceLog>,
        tracker: Arc<dyn SpawnTracker>,
        node_env: IndexMap<String, String>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let (cluster_min, cluster_max) = spec.cluster.resolve(cpus);
        Arc::new(Self {
            allocator: AddrAllocator::for_service(&name),
            name,
            spec,
            run_id,
            run_dir,
            lb,
            log,
            tracker,
            node_env,
            procs: Mutex::new(Vec::new()),
            up_ticks: AtomicU32::new(0),
            cpu: Arc::new(CpuHistory::new()),
            cluster_min,
            cluster_max,
            cancel,
        })
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cpu_history(&self) -> &CpuHistory {
        &self.cpu
    }

    pub fn processes(&self) -> Vec<Arc<ProcessState>> {
        self.procs.lock().clone()
    }

    /// Spawn one instance and gate on readiness.
    pub async fn spawn_one(self: &Arc<Self>) -> Result<Arc<ProcessState>, SupervisorError> {
        let (host, port) = self
            .allocator
            .allocate()
            .map_err(|e| SupervisorError::Spawn(self.name.clone(), e.to_string()))?;
        let addr = format!("{host}:{port}");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.spec.run)
            .current_dir(&self.run_dir)
            .env(ENV_TAG, "1")
            .env(ENV_SERVICE, &self.name)
            .env(ENV_RUN_ID, &self.run_id)
            .envs(self.node_env.iter())
            .envs(self.spec.env.iter())
            .env(self.spec.host_env.as_deref().unwrap_or("HOST"), host.to_string())
            .env(self.spec.port_env.as_deref().unwrap_or("PORT"), port.to_string())
            .env(self.spec.listen_env.as_deref().unwrap_or("LISTEN"), &addr)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| SupervisorError::Spawn(self.name.clone(), e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::Spawn(self.name.clone(), "no pid".into()))?;

        if let Some(stdout) = child.stdout.take() {
            pump(Arc::clone(&self.log), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            pump(Arc::clone(&self.log), stderr);
        }

        let started_ms = epoch_ms();
        self.tracker.record_spawn(pid, std::process::id(), started_ms);
        let _ = self.log.append_line(&format!("spawned pid {pid} on {addr}"));

        let state = Arc::new(ProcessState {
            pid,
            addr: addr.clone(),
            upstream: Upstream::new(addr.clone()),
            started_ms,
            deadline_ms: AtomicU64::new(0),
            deadline_extended: AtomicBool::new(false),
            signal_sent: AtomicBool::new(false),
            down_ticks: AtomicU32::new(0),
            dead: AtomicBool::new(false),
            child: tokio::sync::Mutex::new(Some(child)),
            cancel: self.cancel.child_token(),
        });

        // Block until healthy or the readiness window closes.
        if !wait_ready(&addr, self.spec.ready_timeout).await {
            let _ = self.log.append_line(&format!("pid {pid} missed readiness window"));
            state.terminate(self.spec.stop_timeout).await;
            return Err(SupervisorError::NeverReady(self.name.clone(), addr));
        }

        state.upstream.set_healthy(true);
        self.lb.add(Arc::clone(&state.upstream));
        self.procs.lock().push(Arc::clone(&state));
        self.observe_health(Arc::clone(&state));
        info!(service = %self.name, pid, %addr, "instance healthy");
        Ok(state)
    }

    /// Continuous health observer: an unhealthy span longer than
    /// `unhealthy_timeout` terminates the instance (the tick respawns).
    fn observe_health(self: &Arc<Self>, state: Arc<ProcessState>) {
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            let mut unhealthy_since: Option<tokio::time::Instant> = None;
            let mut tick = tokio::time::interval(OBSERVE_EVERY);
            loop {
                tokio::select! {
                    _ = state.cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                if state.terminating() {
                    return;
                }
                let ok = tokio::net::TcpStream::connect(&state.addr).await.is_ok();
                if ok {
                    unhealthy_since = None;
                    state.upstream.set_healthy(true);
                    continue;
                }
                state.upstream.set_healthy(false);
                let since = unhealthy_since.get_or_insert_with(tokio::time::Instant::now);
                if since.elapsed() > cluster.spec.unhealthy_timeout {
                    warn!(service = %cluster.name, pid = state.pid, "unhealthy past deadline; terminating");
                    cluster.remove_and_terminate(&state).await;
                    return;
                }
            }
        });
    }

    /// Pull an instance out of rotation and run the termination protocol.
    pub async fn remove_and_terminate(&self, state: &Arc<ProcessState>) {
        self.lb.remove(&state.upstream);
        state.terminate(self.spec.stop_timeout).await;
        self.procs.lock().retain(|p| !Arc::ptr_eq(p, state));
    }

    /// Stop the whole cluster: concurrent termination, then the shutdown
    /// commands.
    pub async fn stop(self: &Arc<Self>) {
        let procs = self.processes();
        let stop_timeout = self.spec.stop_timeout;
        let mut joins = Vec::new();
        for proc_ in procs {
            self.lb.remove(&proc_.upstream);
            let proc_ = Arc::clone(&proc_);
            joins.push(tokio::spawn(async move {
                proc_.terminate(stop_timeout).await;
            }));
        }
        for join in joins {
            let _ = join.await;
        }
        self.procs.lock().clear();

        for command in &self.spec.shutdown {
            let result = Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.run_dir)
                .status()
                .await;
            if let Err(err) = result {
                warn!(service = %self.name, command, %err, "shutdown command failed");
            }
        }
        self.cancel.cancel();
    }
}

#[async_trait]
impl Handler for ProcCluster {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        self.lb.dispatch(cx).await
    }

    fn describe(&self) -> String {
        format!("cluster[{} x{}]", self.name, self.procs.lock().len())
    }
}

#[cfg(test)]
#[path = "proc_tests.rs"]
mod tests;
