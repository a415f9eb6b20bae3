// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Service state: one supervised unit and its live instance.

use crate::buildfs::{BuildFs, BuildFsError};
use crate::fileserver::FileServer;
use crate::hashdir::hash_service_root;
use crate::logs::ServiceLog;
use crate::proc::ProcCluster;
use crate::reaper::SpawnTracker;
use async_trait::async_trait;
use indexmap::IndexMap;
use pm3_core::{new_run_id, EdgeError};
use pm3_manifest::{ProcSpec, ServiceSpec};
use pm3_proxy::{Exchange, Flow, Handler, LoadBalancer, RetryPolicy, Strategy};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("service {0}: spawn failed: {1}")]
    Spawn(String, String),

    #[error("service {0}: instance at {1} never became ready")]
    NeverReady(String, String),

    #[error("service {0}: build command {1:?} failed with status {2}")]
    BuildCommand(String, String, i32),

    #[error(transparent)]
    BuildFs(#[from] BuildFsError),

    #[error("service {0}: {1}")]
    Io(String, #[source] std::io::Error),
}

/// The live instance variant behind a service.
pub enum ServiceInstance {
    FileServer(Arc<FileServer>),
    Cluster(Arc<ProcCluster>),
    /// `run` was empty: nothing supervised, handlers fall through.
    Passive,
}

/// One supervised service between reloads.
pub struct ServiceState {
    pub name: String,
    pub run_id: String,
    /// Serialized spec bytes deciding replace-vs-keep on reload.
    pub identity: Vec<u8>,
    pub instance: ServiceInstance,
    pub start_error: Option<String>,
    spec: ServiceSpec,
    cancel: CancellationToken,
}

impl ServiceState {
    /// Start a service: load, build, spawn, gate.
    pub async fn start(
        name: String,
        spec: ServiceSpec,
        deps: &StartDeps,
        invalidate: bool,
    ) -> Arc<Self> {
        let run_id = new_run_id();
        let identity = spec.identity();
        let cancel = deps.parent_cancel.child_token();

        let (instance, start_error) =
            match Self::start_instance(&name, &spec, deps, &run_id, invalidate, &cancel).await {
                Ok(instance) => (instance, None),
                Err(err) => {
                    warn!(service = %name, %err, "service failed to start");
                    (ServiceInstance::Passive, Some(err.to_string()))
                }
            };

        Arc::new(Self { name, run_id, identity, instance, start_error, spec, cancel })
    }

    async fn start_instance(
        name: &str,
        spec: &ServiceSpec,
        deps: &StartDeps,
        run_id: &str,
        invalidate: bool,
        cancel: &CancellationToken,
    ) -> Result<ServiceInstance, SupervisorError> {
        match spec {
            ServiceSpec::FileServer(fs_spec) => {
                let server = FileServer::load(fs_spec)
                    .map_err(|e| SupervisorError::Io(name.to_string(), e))?;
                info!(service = name, files = server.len(), "file server up");
                Ok(ServiceInstance::FileServer(Arc::new(server)))
            }
            ServiceSpec::Proc(proc_spec) if proc_spec.run.is_empty() => {
                Ok(ServiceInstance::Passive)
            }
            ServiceSpec::Proc(proc_spec) => {
                let run_dir =
                    build_if_needed(name, proc_spec, invalidate).await?;
                let log_name = proc_spec.log.clone().unwrap_or_else(|| name.to_string());
                let log = Arc::new(
                    ServiceLog::open(&deps.logs_dir, log_name.as_str())
                        .map_err(|e| SupervisorError::Io(name.to_string(), e))?,
                );
                let strategy = proc_spec
                    .strategy
                    .as_deref()
                    .and_then(Strategy::parse)
                    .unwrap_or(Strategy::LeastConn);
                let lb = LoadBalancer::with_policies(
                    strategy,
                    proc_spec.sticky,
                    RetryPolicy::default(),
                    proc_spec.on_404.as_ref().map(policy_of),
                    proc_spec.on_4xx.as_ref().map(policy_of),
                    proc_spec.on_5xx.as_ref().map(policy_of),
                );
                let cluster = ProcCluster::new(
                    name.to_string(),
                    proc_spec.clone(),
                    run_id.to_string(),
                    run_dir,
                    lb,
                    log,
                    Arc::clone(&deps.tracker),
                    deps.node_env.clone(),
                    cancel.child_token(),
                );
                cluster.spawn_one().await?;
                cluster.spawn_ticker();
                Ok(ServiceInstance::Cluster(cluster))
            }
            // Wrappers lower at manifest-prepare time; reaching here is a bug
            // upstream, treat as passive rather than crash.
            _ => Ok(ServiceInstance::Passive),
        }
    }

    /// Stop the service and everything under it.
    pub async fn stop(&self) {
        match &self.instance {
            ServiceInstance::Cluster(cluster) => cluster.stop().await,
            ServiceInstance::FileServer(_) | ServiceInstance::Passive => {
                // Passive services may still carry shutdown commands.
                if let ServiceSpec::Proc(spec) = &self.spec {
                    run_shutdown_commands(&self.name, spec).await;
                }
            }
        }
        self.cancel.cancel();
    }

    pub fn healthy(&self) -> bool {
        match &self.instance {
            ServiceInstance::FileServer(_) | ServiceInstance::Passive => {
                self.start_error.is_none()
            }
            ServiceInstance::Cluster(cluster) => {
                cluster.processes().iter().any(|p| p.healthy())
            }
        }
    }
}

#[async_trait]
impl Handler for ServiceState {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        match &self.instance {
            ServiceInstance::FileServer(server) => server.serve(cx).await,
            ServiceInstance::Cluster(cluster) => cluster.serve(cx).await,
            ServiceInstance::Passive => Ok(Flow::Continue),
        }
    }

    fn describe(&self) -> String {
        match &self.instance {
            ServiceInstance::FileServer(server) => server.describe(),
            ServiceInstance::Cluster(cluster) => cluster.describe(),
            ServiceInstance::Passive => format!("passive[{}]", self.name),
        }
    }
}

/// Everything `ServiceState::start` needs from the daemon.
pub struct StartDeps {
    pub logs_dir: PathBuf,
    pub tracker: Arc<dyn SpawnTracker>,
    pub node_env: IndexMap<String, String>,
    pub parent_cancel: CancellationToken,
}

fn policy_of(spec: &pm3_manifest::StatusPolicySpec) -> pm3_proxy::StatusPolicy {
    pm3_proxy::StatusPolicy {
        limit: spec.limit.clone(),
        body: spec.body.clone(),
        retry: spec.retry,
    }
}

async fn run_shutdown_commands(name: &str, spec: &ProcSpec) {
    for command in &spec.shutdown {
        let result = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&spec.root)
            .stdin(Stdio::null())
            .status()
            .await;
        if let Err(err) = result {
            warn!(service = name, command, %err, "shutdown command failed");
        }
    }
}

/// Hash the root, compare against the selected build, rebuild on change
/// (or when invalidated). Returns the directory processes run in.
async fn build_if_needed(
    name: &str,
    spec: &ProcSpec,
    invalidate: bool,
) -> Result<PathBuf, SupervisorError> {
    if spec.build.is_empty() {
        return Ok(spec.root.clone());
    }

    let buildfs = BuildFs::new(&spec.root);
    let hash =
        hash_service_root(&spec.root).map_err(|e| SupervisorError::Io(name.to_string(), e))?;

    if !invalidate && buildfs.read_build_id().as_deref() == Some(hash.as_str()) {
        info!(service = name, "build cache hit");
        return Ok(buildfs.run_dir());
    }

    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let commands = spec.build.clone();
    let root = spec.root.clone();
    let service = name.to_string();

    buildfs
        .run_build(&hash, now_ms, |scratch| async move {
            // The scratch starts as a source snapshot; build commands run
            // inside it and the whole result becomes the archive.
            copy_tree(&root, &scratch).map_err(|e| BuildFsError::Build(e.to_string()))?;
            for command in &commands {
                info!(service = %service, command, "build step");
                let status = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .current_dir(&scratch)
                    .stdin(Stdio::null())
                    .status()
                    .await
                    .map_err(|e| BuildFsError::Build(e.to_string()))?;
                if !status.success() {
                    return Err(BuildFsError::Build(format!(
                        "{command:?} exited {}",
                        status.code().unwrap_or(-1)
                    )));
                }
            }
            Ok(())
        })
        .await?;
    Ok(buildfs.run_dir())
}

/// Copy the service source into the scratch dir, skipping build-cache
/// entries and VCS metadata.
fn copy_tree(from: &std::path::Path, to: &std::path::Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str == ".run"
            || name_str == ".build"
            || name_str.starts_with(".build-")
            || name_str == ".git"
        {
            continue;
        }
        let target = to.join(&name);
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "instance_tests.rs"]
mod tests;
