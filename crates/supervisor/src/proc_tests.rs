// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::logs::ServiceLog;
use crate::reaper::NullTracker;
use pm3_manifest::ProcSpec;
use pm3_proxy::{LoadBalancer, RetryPolicy, Strategy};

fn cluster_with(run: &str, ready_timeout: Duration, stop_timeout: Duration) -> (tempfile::TempDir, Arc<ProcCluster>) {
    let dir = tempfile::tempdir().unwrap();
    let spec = ProcSpec {
        root: dir.path().to_path_buf(),
        run: run.to_string(),
        ready_timeout,
        stop_timeout,
        ..ProcSpec::default()
    };
    let log = Arc::new(ServiceLog::open(dir.path().join("logs"), "test").unwrap());
    let cluster = ProcCluster::new(
        "test".into(),
        spec,
        "run-test".into(),
        dir.path().to_path_buf(),
        LoadBalancer::new(Strategy::RoundRobin, false, RetryPolicy::default()),
        log,
        Arc::new(NullTracker),
        IndexMap::new(),
        CancellationToken::new(),
    );
    (dir, cluster)
}

fn pid_alive(pid: u32) -> bool {
    kill(NixPid::from_raw(pid as i32), None).is_ok()
}

#[tokio::test]
async fn wait_ready_succeeds_once_listening() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    assert!(wait_ready(&addr, Duration::from_secs(1)).await);
}

#[tokio::test]
async fn wait_ready_times_out_without_listener() {
    let started = tokio::time::Instant::now();
    assert!(!wait_ready("127.0.0.1:1", Duration::from_millis(300)).await);
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn spawn_fails_readiness_and_kills_the_child() {
    // `sleep` never listens, so the readiness window closes.
    let (_dir, cluster) =
        cluster_with("sleep 30", Duration::from_millis(400), Duration::from_millis(400));
    let err = cluster.spawn_one().await.unwrap_err();
    assert!(matches!(err, SupervisorError::NeverReady(_, _)));
    assert!(cluster.processes().is_empty());
}

#[tokio::test]
async fn sigint_ignorer_is_killed_by_the_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("pid");
    let run = format!("echo $$ > {}; trap '' INT; sleep 60", pidfile.display());
    let spec = ProcSpec {
        root: dir.path().to_path_buf(),
        run,
        ready_timeout: Duration::from_millis(200),
        stop_timeout: Duration::from_millis(800),
        ..ProcSpec::default()
    };
    let log = Arc::new(ServiceLog::open(dir.path().join("logs"), "stubborn").unwrap());
    let cluster = ProcCluster::new(
        "stubborn".into(),
        spec,
        "run-x".into(),
        dir.path().to_path_buf(),
        LoadBalancer::new(Strategy::RoundRobin, false, RetryPolicy::default()),
        log,
        Arc::new(NullTracker),
        IndexMap::new(),
        CancellationToken::new(),
    );

    // Readiness fails (nothing listens); the internal terminate has to
    // fight through the ignored interrupt and tree-kill at the deadline.
    let started = std::time::Instant::now();
    let err = cluster.spawn_one().await.unwrap_err();
    assert!(matches!(err, SupervisorError::NeverReady(_, _)));
    assert!(started.elapsed() < Duration::from_secs(4), "bounded by stop_timeout");

    let pid: u32 = std::fs::read_to_string(&pidfile).unwrap().trim().parse().unwrap();
    // Give the kill a beat to land, then the shell must be gone.
    std::thread::sleep(Duration::from_millis(200));
    assert!(!pid_alive(pid), "pid {pid} survived termination");
}

#[tokio::test]
async fn terminate_sends_exactly_one_signal_across_racers() {
    let state = ProcessState::stub(i32::MAX as u32 - 7, "127.0.0.1:9", 0);
    let stop = Duration::from_millis(200);

    let (a, b, c) = tokio::join!(
        state.terminate(stop),
        state.terminate(stop),
        state.terminate(stop),
    );
    let _ = (a, b, c);
    assert_eq!(state.signals_sent(), 1);
    assert!(!state.alive().await);
    assert!(state.cancelled().is_cancelled());
}

#[tokio::test]
async fn terminate_marks_upstream_unhealthy_immediately() {
    let state = ProcessState::stub(i32::MAX as u32 - 8, "127.0.0.1:9", 0);
    state.upstream.set_healthy(true);
    state.terminate(Duration::from_millis(100)).await;
    assert!(!state.upstream.healthy());
    assert!(state.terminating());
}

#[tokio::test]
async fn terminate_waits_for_drain_before_signal() {
    let state = ProcessState::stub(i32::MAX as u32 - 9, "127.0.0.1:9", 0);
    state.upstream.set_healthy(true);
    let guard = state.upstream.begin();

    let started = tokio::time::Instant::now();
    let stop = Duration::from_millis(600);
    let termination = {
        let state = Arc::clone(&state);
        tokio::spawn(async move { state.terminate(stop).await })
    };

    // Release the in-flight request shortly after; drain should end early.
    tokio::time::sleep(Duration::from_millis(250)).await;
    drop(guard);
    termination.await.unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "waited for drain");
    assert!(elapsed < Duration::from_millis(600), "did not burn the whole deadline");
    assert_eq!(state.signals_sent(), 1);
}

#[tokio::test]
async fn real_child_is_terminated_and_reaped() {
    let (_dir, cluster) = cluster_with("sleep 60", Duration::from_millis(100), Duration::from_secs(2));

    // Launch directly (readiness will fail, which exercises the kill path).
    let before = std::time::Instant::now();
    let err = cluster.spawn_one().await.unwrap_err();
    assert!(matches!(err, SupervisorError::NeverReady(_, _)));
    assert!(before.elapsed() < Duration::from_secs(5));

    // No instance left behind.
    assert!(cluster.processes().is_empty());
}

#[tokio::test]
async fn stop_runs_shutdown_commands() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("stopped.marker");
    let spec = ProcSpec {
        root: dir.path().to_path_buf(),
        run: String::new(),
        shutdown: vec![format!("touch {}", marker.display())],
        ..ProcSpec::default()
    };
    let log = Arc::new(ServiceLog::open(dir.path().join("logs"), "test").unwrap());
    let cluster = ProcCluster::new(
        "test".into(),
        spec,
        "run-test".into(),
        dir.path().to_path_buf(),
        LoadBalancer::new(Strategy::RoundRobin, false, RetryPolicy::default()),
        log,
        Arc::new(NullTracker),
        IndexMap::new(),
        CancellationToken::new(),
    );

    cluster.stop().await;
    assert!(marker.exists());
    assert!(cluster.cancel_token().is_cancelled());
}

#[tokio::test]
async fn spawned_child_gets_env_tag_and_listen_vars() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("env.out");
    // The child dumps its environment and exits. Readiness fails, but the
    // dump proves what the contract injected.
    let spec = ProcSpec {
        root: dir.path().to_path_buf(),
        run: format!("env > {}; sleep 1", out.display()),
        ready_timeout: Duration::from_millis(300),
        stop_timeout: Duration::from_millis(300),
        ..ProcSpec::default()
    };
    let log = Arc::new(ServiceLog::open(dir.path().join("logs"), "envtest").unwrap());
    let cluster = ProcCluster::new(
        "envtest".into(),
        spec,
        "run-abc".into(),
        dir.path().to_path_buf(),
        LoadBalancer::new(Strategy::RoundRobin, false, RetryPolicy::default()),
        log,
        Arc::new(NullTracker),
        IndexMap::from_iter([("NODE_ENV".to_string(), "production".to_string())]),
        CancellationToken::new(),
    );

    let _ = cluster.spawn_one().await;
    let dumped = std::fs::read_to_string(&out).unwrap();
    assert!(dumped.contains("PM3G=1"), "{dumped}");
    assert!(dumped.contains("PM3_SERVICE=envtest"));
    assert!(dumped.contains("PM3_RUN_ID=run-abc"));
    assert!(dumped.contains("NODE_ENV=production"));
    assert!(dumped.contains("PORT="));
    assert!(dumped.contains("LISTEN=127."));
}

#[test]
fn dead_pid_probe_helper_behaves() {
    assert!(pid_alive(std::process::id()));
}
