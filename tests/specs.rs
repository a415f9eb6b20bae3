// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cross-crate scenario specs.
//!
//! Each test drives several subsystems together the way the daemon wires
//! them: manifest -> registry -> vhosts -> proxy entry, supervisor build
//! cache, and the rate-limit escalation ladder.

use bytes::Bytes;
use pm3_broker::BrokerClient;
use pm3_core::{Clock, EdgeError, FakeClock, SystemClock};
use pm3_manifest::{Manifest, ProcSpec, ServiceSpec};
use pm3_proxy::{
    build_pipeline, enforce, render_error, CertStore, ErrorContext, ErrorTemplates, Handler,
    IpInfoStack, LimitOutcome, Pipeline, ProxyServer, RegistryEnv, ServerConfig, ServiceDirectory,
    SessionTable, Vhost,
};
use pm3_supervisor::{NullTracker, ServiceState, StartDeps};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

struct NoServices;

impl ServiceDirectory for NoServices {
    fn lookup(&self, _name: &str) -> Option<Arc<dyn Handler>> {
        None
    }
}

fn registry_env() -> RegistryEnv {
    RegistryEnv {
        services: Arc::new(NoServices),
        broker: Arc::new(pm3_broker::MemoryBroker::new()),
    }
}

async fn start_server(vhosts: Vec<Arc<Vhost>>) -> (std::net::SocketAddr, CancellationToken) {
    let sessions = Arc::new(SessionTable::new(SystemClock, Arc::new(IpInfoStack::builtin())));
    let certs = CertStore::new(b"spec-secret").unwrap();
    let server = ProxyServer::new(
        ServerConfig { bind: "127.0.0.1".into(), http_port: 0, https_port: 0 },
        b"spec-secret".to_vec(),
        sessions,
        certs,
    );
    server.router.install(vhosts);
    let (http, https) = server.bind().await.unwrap();
    let addr = http.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(server.serve(http, https, cancel.clone()));
    (addr, cancel)
}

async fn raw_get(addr: std::net::SocketAddr, host: &str, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nhost: {host}\r\nconnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out).await;
    String::from_utf8_lossy(&out).to_string()
}

/// A manifest's vhost handlers, built by the registry, serve through the
/// proxy front door with ray headers attached.
#[tokio::test]
async fn manifest_vhost_serves_through_the_proxy() {
    let manifest = Manifest::parse(
        r#"
server:
  hosts:
    example.com:
      no_upgrade: true
      handlers:
        - "status 418"
"#,
    )
    .unwrap();

    let env = registry_env();
    let spec = &manifest.server.hosts["example.com"];
    let pipeline = build_pipeline(&spec.handlers, &env).unwrap();
    let vhost = Arc::new(Vhost {
        hostnames: vec!["example.com".into()],
        pipeline,
        no_upgrade: spec.no_upgrade,
        cert_key: None,
    });

    let (addr, cancel) = start_server(vec![vhost]).await;
    let reply = raw_get(addr, "example.com", "/anything").await;
    assert!(reply.starts_with("HTTP/1.1 418"), "{reply}");
    assert!(reply.to_lowercase().contains("p-ray:"), "{reply}");

    // A host the manifest never declared gets a reset, not a page.
    let reply = raw_get(addr, "ghost.net", "/").await;
    assert!(reply.is_empty());
    cancel.cancel();
}

/// Mux fallthrough and drop semantics compose through nested pipelines.
#[tokio::test]
async fn mux_pipeline_composes_from_manifest_nodes() {
    let nodes: Vec<serde_yaml::Value> = serde_yaml::from_str(
        r#"
- !Mux
  "example.com/blocked/": "drop"
  "example.com/teapot": "status 418"
- "status 200"
"#,
    )
    .unwrap();
    let pipeline = build_pipeline(&nodes, &registry_env()).unwrap();
    let vhost = Arc::new(Vhost {
        hostnames: vec!["example.com".into()],
        pipeline,
        no_upgrade: true,
        cert_key: None,
    });

    let (addr, cancel) = start_server(vec![vhost]).await;

    let reply = raw_get(addr, "example.com", "/teapot").await;
    assert!(reply.starts_with("HTTP/1.1 418"), "{reply}");

    // Unmatched mux entries fall through to the next handler.
    let reply = raw_get(addr, "example.com", "/other").await;
    assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");

    // Drop bubbles to the top level and resets the connection.
    let reply = raw_get(addr, "example.com", "/blocked/thing").await;
    assert!(reply.is_empty(), "{reply}");
    cancel.cancel();
}

/// Spec scenario: limit "10 per second, block 1 min". Ten pass, the
/// eleventh throttles with Retry-After, the twelfth inside the minute is
/// WSF-blocked (1021), and after the minute requests succeed again.
#[test]
fn rate_block_escalation_ladder() {
    let clock = FakeClock::new();
    let table = SessionTable::new(clock.clone(), Arc::new(IpInfoStack::builtin()));
    let session = table.start_request("1.2.3.4".parse().unwrap(), &http::HeaderMap::new());
    let limit: pm3_core::RateLimit = "10/1s block 1m".parse().unwrap();

    let now = clock.epoch_ms();
    for i in 0..10 {
        assert_eq!(enforce(&session, &limit, now), LimitOutcome::Allow, "request {i}");
    }

    // Request 11: over the limit, session blocked for a minute.
    match enforce(&session, &limit, now) {
        LimitOutcome::Block { until_ms } => assert_eq!(until_ms, now + 60_000),
        other => panic!("expected block, got {other:?}"),
    }

    // Request 12 within the minute: the entry gate answers 1021.
    assert!(session.blocked(now + 30_000));
    let ray = pm3_core::new_ray_id();
    let page = render_error(
        &EdgeError::blocked(),
        &ErrorContext { host: "node", ray: &ray, client_ip: session.ip },
        None,
        &ErrorTemplates::new(),
    );
    assert_eq!(page.headers.get("p-status").unwrap(), "1021");

    // Request 13 after the minute: unblocked, fresh window.
    clock.advance(std::time::Duration::from_secs(61));
    let later = clock.epoch_ms();
    assert!(!session.blocked(later));
    assert_eq!(enforce(&session, &limit, later), LimitOutcome::Allow);
}

/// Spec scenario: with an unchanged source tree a restart skips every
/// build command; invalidation reruns them in order.
#[tokio::test]
async fn build_cache_hit_and_invalidate() {
    let root = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("main.js"), "console.log(1)").unwrap();
    let log = outside.path().join("build.log");

    let spec = ServiceSpec::Proc(ProcSpec {
        root: root.path().to_path_buf(),
        build: vec![
            format!("echo first >> {}", log.display()),
            format!("echo second >> {}", log.display()),
        ],
        ..ProcSpec::default()
    });
    let deps = StartDeps {
        logs_dir: outside.path().join("logs"),
        tracker: Arc::new(NullTracker),
        node_env: Default::default(),
        parent_cancel: CancellationToken::new(),
    };

    // First start builds; passive service (no run) otherwise.
    let state = ServiceState::start("api".into(), spec.clone(), &deps, false).await;
    assert!(state.start_error.is_none());
    let lines: Vec<String> = std::fs::read_to_string(&log)
        .unwrap()
        .lines()
        .map(String::from)
        .collect();
    assert_eq!(lines, ["first", "second"], "ordered build commands");

    // Unchanged tree: cache hit, no commands run.
    ServiceState::start("api".into(), spec.clone(), &deps, false).await;
    assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 2);

    // Invalidate: every command reruns, in order.
    ServiceState::start("api".into(), spec, &deps, true).await;
    let lines: Vec<String> = std::fs::read_to_string(&log)
        .unwrap()
        .lines()
        .map(String::from)
        .collect();
    assert_eq!(lines, ["first", "second", "first", "second"]);
}

/// Runner messages and HTTP requests share one pipeline implementation.
#[tokio::test]
async fn runners_reuse_http_handlers() {
    let broker = Arc::new(pm3_broker::MemoryBroker::new());
    broker.ensure_stream("jobs").await.unwrap();
    broker.ensure_kv(pm3_broker::KV_RESULTS).await.unwrap();

    let nodes: Vec<serde_yaml::Value> = serde_yaml::from_str("[\"status 201\"]").unwrap();
    let env = RegistryEnv { services: Arc::new(NoServices), broker: broker.clone() };
    let pipeline: Pipeline = build_pipeline(&nodes, &env).unwrap();

    let table = SessionTable::new(SystemClock, Arc::new(IpInfoStack::builtin()));
    let session = table.start_request("127.0.0.1".parse().unwrap(), &http::HeaderMap::new());

    let spec = pm3_manifest::RunnerSpec {
        subject: "jet.jobs.work".into(),
        store_results: true,
        ..pm3_manifest::RunnerSpec::default()
    };
    let runner = pm3_runner::MessageRunner::new(
        spec,
        pipeline,
        broker.clone(),
        session,
        "spec-machine".into(),
        CancellationToken::new(),
    );

    broker
        .publish("jet.jobs.work", vec![], Bytes::from("payload"))
        .await
        .unwrap();
    let mut msgs = broker
        .fetch("jobs", "", "g", 1, std::time::Duration::from_millis(200))
        .await
        .unwrap();
    runner.handle(msgs.remove(0)).await;

    // 2xx acked and stored; nothing left to redeliver.
    let empty = broker
        .fetch("jobs", "", "g", 1, std::time::Duration::from_millis(100))
        .await
        .unwrap();
    assert!(empty.is_empty());
}
