// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The session reconciler.
//!
//! `open` acquires the node (lock, secret, orphan reap, broker gateway,
//! proxy), then `reload` keeps converging the running state onto the
//! manifest: vhosts, broker declarations, services (start / replace /
//! stop), runners and schedules. Reloads are serialized; a failed parse
//! leaves the previous state serving.

use crate::directory::ServiceMap;
use crate::env::Dirs;
use indexmap::IndexMap;
use pm3_broker::{subject, BrokerClient, BrokerError, MemoryBroker, KV_GLOBAL, KV_RESULTS, KV_SCHED};
use pm3_core::SystemClock;
use pm3_manifest::{CertSource, Manifest, ManifestError};
use pm3_proxy::{
    build_handler, build_pipeline, CertStore, ErrorTemplates, FileCert, IpInfoStack,
    MarkerProvider, ProxyError, ProxyServer, RegistryEnv, ServerConfig, SessionTable, Vhost,
};
use pm3_runner::{MessageRunner, Scheduler};
use pm3_supervisor::{OrphanReaper, ServiceState, StartDeps};
use rand::RngCore;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Grace for concurrent service stops during shutdown.
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not determine the config directory")]
    NoConfigDir,

    #[error("another pm3 daemon is already running")]
    AlreadyRunning(#[source] std::io::Error),

    #[error("failed to create node key material at {0}: {1}")]
    Secret(PathBuf, #[source] std::io::Error),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub struct DaemonSession {
    pub dirs: Dirs,
    manifest_path: PathBuf,
    // NOTE(lifetime): held to keep the exclusive config-dir lock.
    #[allow(dead_code)]
    lock_file: std::fs::File,
    secret: Vec<u8>,
    pub machine_id: String,
    pub broker: Arc<dyn BrokerClient>,
    pub proxy: Arc<ProxyServer>,
    pub sessions: Arc<SessionTable<SystemClock>>,
    pub services: Arc<ServiceMap>,
    runners: parking_lot::Mutex<Vec<Arc<MessageRunner>>>,
    runner_cancel: parking_lot::Mutex<CancellationToken>,
    reload_lock: tokio::sync::Mutex<()>,
    reaper: Arc<OrphanReaper>,
    /// Session context; cancellation cascades to every component.
    pub cancel: CancellationToken,
    /// Tripped by `POST /shutdown` and signals; main watches it.
    pub shutdown_requested: CancellationToken,
    node_env: parking_lot::Mutex<IndexMap<String, String>>,
}

impl std::fmt::Debug for DaemonSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonSession").finish_non_exhaustive()
    }
}

impl DaemonSession {
    /// Acquire the node and apply the first reload.
    pub async fn open(dirs: Dirs, manifest_path: PathBuf) -> Result<Arc<Self>, SessionError> {
        dirs.create_all()?;

        // Fail fast if another daemon owns the directory.
        let lock_file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(dirs.lock_path())?;
        fs2::FileExt::try_lock_exclusive(&lock_file).map_err(SessionError::AlreadyRunning)?;
        let mut lock_file = lock_file;
        lock_file.set_len(0)?;
        writeln!(lock_file, "{}", std::process::id())?;

        let secret = load_or_create_secret(&dirs)?;
        let machine_id = machine_id_from(&secret);

        // Reap orphans from a previous daemon before anything spawns.
        let reaper = Arc::new(OrphanReaper::new(dirs.tracker_path()));
        let reaped = reaper.reap(std::process::id());
        if !reaped.is_empty() {
            info!(count = reaped.len(), mode = ?reaper.mode(), "reaped orphaned processes");
        }

        // Embedded broker gateway with the standing buckets.
        let broker: Arc<dyn BrokerClient> = Arc::new(MemoryBroker::new());
        for bucket in [KV_GLOBAL, KV_RESULTS, KV_SCHED] {
            broker.ensure_kv(bucket).await?;
        }

        let cancel = CancellationToken::new();
        let sessions = Arc::new(SessionTable::new(SystemClock, Arc::new(IpInfoStack::builtin())));
        sessions.spawn_janitor(cancel.child_token());

        // The proxy's listener config comes from the manifest.
        let manifest = Manifest::load(&manifest_path)?;
        let certs = CertStore::new(&secret)?;
        let proxy = ProxyServer::new(
            ServerConfig {
                bind: manifest.server.bind.clone(),
                http_port: manifest.server.http,
                https_port: manifest.server.https,
            },
            secret.clone(),
            Arc::clone(&sessions),
            certs,
        );

        let session = Arc::new(Self {
            dirs,
            manifest_path,
            lock_file,
            secret,
            machine_id,
            broker,
            proxy,
            sessions,
            services: ServiceMap::new(),
            runners: parking_lot::Mutex::new(Vec::new()),
            runner_cancel: parking_lot::Mutex::new(cancel.child_token()),
            reload_lock: tokio::sync::Mutex::new(()),
            reaper,
            cancel,
            shutdown_requested: CancellationToken::new(),
            node_env: parking_lot::Mutex::new(IndexMap::new()),
        });

        session
            .proxy
            .set_rpc_handler(Arc::new(crate::rpc::RpcHandler::new(&session)));
        session.reload(false).await?;
        Ok(session)
    }

    /// Spawn the proxy listeners.
    pub fn run(self: &Arc<Self>) {
        let proxy = Arc::clone(&self.proxy);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            if let Err(err) = proxy.run(cancel).await {
                warn!(%err, "proxy stopped");
            }
        });
    }

    pub fn rpc_secret(&self) -> String {
        hex::encode(&self.secret)
    }

    pub fn runner_count(&self) -> usize {
        self.runners.lock().len()
    }

    /// Reconcile to the manifest. Serialized; `invalidate` forces builds.
    pub async fn reload(self: &Arc<Self>, invalidate: bool) -> Result<(), SessionError> {
        let _guard = self.reload_lock.lock().await;

        // 1. Parse. Failure here leaves everything as it was.
        let mut manifest = Manifest::load(&self.manifest_path)?;
        if let Some(base) = self.manifest_path.parent() {
            manifest.resolve_roots(base)?;
        }

        // 2. Node environment, revision vars included when present.
        let mut node_env = manifest.env.clone();
        for key in ["PM3_COMMIT", "PM3_BRANCH"] {
            if let Ok(value) = std::env::var(key) {
                node_env.entry(key.to_string()).or_insert(value);
            }
        }
        *self.node_env.lock() = node_env.clone();

        // 3. IP-info provider stack.
        let mut providers: Vec<Arc<dyn pm3_proxy::IpInfoProvider>> =
            vec![Arc::new(pm3_proxy::BuiltinProvider::default())];
        if let Some(markers) = &manifest.ipinfo.markers {
            providers.push(Arc::new(MarkerProvider::new(markers.clone())));
        }
        if manifest.ipinfo.maxmind.is_some() {
            // External provider; consumed through the same seam when wired.
            info!("maxmind database configured; provider attaches out of process");
        }
        self.sessions
            .set_ipinfo(Arc::new(IpInfoStack::new(providers)));

        // 4. Custom error templates.
        self.proxy
            .templates
            .install(manifest.server.error_pages.clone().into_iter().collect());

        // 5. Virtual hosts: build fully, then swap atomically.
        let registry_env = RegistryEnv {
            services: Arc::clone(&self.services) as _,
            broker: Arc::clone(&self.broker),
        };
        let mut vhosts = Vec::with_capacity(manifest.server.hosts.len());
        for (host, spec) in &manifest.server.hosts {
            let pipeline = build_pipeline(&spec.handlers, &registry_env)?;
            let cert_key = match &spec.cert {
                Some(CertSource::File { cert, key }) => {
                    self.proxy.certs.add_file(
                        host.clone(),
                        FileCert { cert_path: cert.clone(), key_path: key.clone() },
                    );
                    Some(host.clone())
                }
                Some(CertSource::Acme) => {
                    // Externally maintained ACME directory under certs/.
                    let base = self.dirs.certs.join(host.trim_start_matches("*."));
                    self.proxy.certs.add_file(
                        host.clone(),
                        FileCert {
                            cert_path: base.join("fullchain.pem"),
                            key_path: base.join("privkey.pem"),
                        },
                    );
                    Some(host.clone())
                }
                None => None,
            };
            let mut hostnames = vec![host.clone()];
            hostnames.extend(spec.also.iter().cloned());
            vhosts.push(Arc::new(Vhost {
                hostnames,
                pipeline,
                no_upgrade: spec.no_upgrade,
                cert_key,
            }));
        }
        self.proxy.router.install(vhosts);

        // 6. Broker declarations.
        for stream in &manifest.jet.streams {
            self.broker.ensure_stream(stream).await?;
        }
        for bucket in &manifest.jet.kv {
            self.broker.ensure_kv(bucket).await?;
        }
        for store in &manifest.jet.obj {
            self.broker.ensure_object_store(store).await?;
        }

        // 7 + 8. Service set: stop the removed, start or replace the rest.
        let previous = self.services.snapshot();
        for (name, state) in previous.iter() {
            if !manifest.services.contains_key(name) {
                info!(service = %name, "stopping removed service");
                let state = Arc::clone(state);
                tokio::spawn(async move { state.stop().await });
            }
        }

        let deps = StartDeps {
            logs_dir: self.dirs.logs.clone(),
            tracker: Arc::clone(&self.reaper).spawn_tracker(),
            node_env,
            parent_cancel: self.cancel.clone(),
        };
        let mut next = IndexMap::with_capacity(manifest.services.len());
        for (name, spec) in &manifest.services {
            let keep = previous
                .get(name)
                .filter(|old| !invalidate && old.identity == spec.identity())
                .cloned();
            match keep {
                Some(old) => {
                    next.insert(name.clone(), old);
                }
                None => {
                    // Spawn the replacement first; the old generation keeps
                    // serving until the new one is in the map.
                    let fresh =
                        ServiceState::start(name.clone(), spec.clone(), &deps, invalidate).await;
                    if let Some(old) = previous.get(name) {
                        info!(service = %name, "replacing service");
                        let old = Arc::clone(old);
                        tokio::spawn(async move { old.stop().await });
                    }
                    next.insert(name.clone(), fresh);
                }
            }
        }
        self.services.install(next);

        // 9. Runner set: cancel the old generation, install the new.
        let runner_cancel = {
            let mut slot = self.runner_cancel.lock();
            let old = std::mem::replace(&mut *slot, self.cancel.child_token());
            old.cancel();
            slot.clone()
        };
        self.runners.lock().clear();

        let local_session = self.sessions.start_request(
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            &http::HeaderMap::new(),
        );
        let scheduler = Scheduler::new(Arc::clone(&self.broker), runner_cancel.clone());

        for (subject_key, spec) in &manifest.runners {
            let pipeline = build_pipeline(&spec.handlers, &registry_env)?;
            let runner = MessageRunner::new(
                spec.clone(),
                pipeline,
                Arc::clone(&self.broker),
                Arc::clone(&local_session),
                self.machine_id.clone(),
                runner_cancel.child_token(),
            );
            runner.spawn();
            self.runners.lock().push(runner);

            let queue = subject::queue_group(subject_key);
            for (index, entry) in spec.schedule.iter().enumerate() {
                scheduler.spawn_entry(subject_key.clone(), queue.clone(), index, entry.clone());
            }
        }

        // Implicit per-service runner: svc.<name>.> routes into the
        // service's own handler.
        for name in manifest.services.keys() {
            let node = serde_yaml::Value::String(name.clone());
            let handler = build_handler(&node, &registry_env)?;
            let spec = pm3_manifest::RunnerSpec {
                subject: format!("svc.{name}.>"),
                // Route svc.<name>.a.b as /a/b inside the service.
                strip_tokens: 2,
                ..pm3_manifest::RunnerSpec::default()
            };
            let runner = MessageRunner::new(
                spec,
                pm3_proxy::Pipeline::new(vec![handler]),
                Arc::clone(&self.broker),
                Arc::clone(&local_session),
                self.machine_id.clone(),
                runner_cancel.child_token(),
            );
            runner.spawn();
            self.runners.lock().push(runner);
        }

        info!(
            services = self.services.len(),
            runners = self.runner_count(),
            "manifest applied"
        );
        Ok(())
    }

    /// Stop one service (or all), then start fresh from the manifest.
    pub async fn restart_service(
        self: &Arc<Self>,
        name: Option<&str>,
        invalidate: bool,
    ) -> Result<(), SessionError> {
        if let Some(name) = name {
            if let Some(state) = self.services.get(name) {
                state.stop().await;
                // Drop it from the map so reload starts it afresh.
                let mut next = (*self.services.snapshot()).clone();
                next.shift_remove(name);
                self.services.install(next);
            }
        } else {
            self.stop_all_services().await;
            self.services.install(IndexMap::new());
        }
        self.reload(invalidate).await
    }

    pub async fn stop_service(&self, name: &str) -> bool {
        let Some(state) = self.services.get(name) else {
            return false;
        };
        state.stop().await;
        let mut next = (*self.services.snapshot()).clone();
        next.shift_remove(name);
        self.services.install(next);
        true
    }

    async fn stop_all_services(&self) {
        let snapshot = self.services.snapshot();
        let mut joins = Vec::new();
        for state in snapshot.values() {
            let state = Arc::clone(state);
            joins.push(tokio::spawn(async move { state.stop().await }));
        }
        for join in joins {
            let _ = join.await;
        }
    }

    /// Graceful shutdown: services concurrently (bounded), then proxy and
    /// broker via context cancellation. The directory lock releases when
    /// the session drops.
    pub async fn shutdown(&self) {
        info!("shutting down");
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.stop_all_services())
            .await
            .is_err()
        {
            warn!("service stop timed out; continuing shutdown");
        }
        self.services.install(IndexMap::new());
        self.runner_cancel.lock().cancel();
        self.cancel.cancel();
        let _ = std::fs::remove_file(self.dirs.lock_path());
        info!("shutdown complete");
    }
}

fn load_or_create_secret(dirs: &Dirs) -> Result<Vec<u8>, SessionError> {
    let path = dirs.secret_path();
    match std::fs::read(&path) {
        Ok(secret) if secret.len() >= 16 => Ok(secret),
        Ok(_) | Err(_) => {
            // First run (or corrupt): mint fresh material. Failure here is
            // one of the two fatal startup paths.
            let mut secret = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            std::fs::write(&path, &secret).map_err(|e| SessionError::Secret(path.clone(), e))?;
            Ok(secret)
        }
    }
}

fn machine_id_from(secret: &[u8]) -> String {
    hex::encode(&secret[..secret.len().min(6)])
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
