// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The RPC surface mounted on the reserved `pm3` host.
//!
//! Pseudo-path routed; accessible to loopback clients presenting the
//! shared secret in Basic auth (peer certificates chaining to the node CA
//! reduce to the same gate through the internal header).

use crate::session::DaemonSession;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use pm3_broker::KV_GLOBAL;
use pm3_core::EdgeError;
use pm3_proxy::{Exchange, Flow, Handler, Response};
use pm3_supervisor::{ProcessTree, ServiceInstance, ServiceLog};
use pm3_wire as wire;
use std::sync::{Arc, Weak};
use sysinfo::System;
use tracing::warn;

pub struct RpcHandler {
    session: Weak<DaemonSession>,
}

impl RpcHandler {
    pub fn new(session: &Arc<DaemonSession>) -> Self {
        Self { session: Arc::downgrade(session) }
    }

    fn authorized(&self, session: &DaemonSession, cx: &Exchange) -> bool {
        if cx.session.local {
            return true;
        }
        if cx
            .headers
            .get(pm3_proxy::INTERNAL_HEADER)
            .and_then(|v| v.to_str().ok())
            == Some("1")
        {
            // Signed URL or authenticated peer.
            return true;
        }
        cx.headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
            .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|cred| cred.split_once(':').map(|(_, pass)| pass.to_string()))
            .map(|pass| pass == session.rpc_secret())
            .unwrap_or(false)
    }
}

fn json_response(status: u16, value: &impl serde::Serialize) -> Response {
    match serde_json::to_vec(value) {
        Ok(body) => Response::with_body(status, "application/json", body),
        Err(_) => Response::new(500),
    }
}

fn parse_body<T: serde::de::DeserializeOwned + Default>(body: &Bytes) -> Result<T, EdgeError> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        EdgeError::new(400, pm3_core::ErrorKind::PermanentUpstream, "Bad Request")
            .explain(format!("unparsable body: {e}"))
    })
}

#[async_trait]
impl Handler for RpcHandler {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        let Some(session) = self.session.upgrade() else {
            return Err(EdgeError::new(503, pm3_core::ErrorKind::Internal, "Shutting Down"));
        };
        if !self.authorized(&session, cx) {
            return Err(EdgeError::unauthorized());
        }

        let path = cx.path().to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let method = cx.method.clone();

        let response = match (method.as_str(), segments.as_slice()) {
            ("POST", ["shutdown"]) => {
                session.shutdown_requested.cancel();
                Response::new(204)
            }

            ("GET", ["peers"]) => {
                // Peer discovery hook: single node reports itself.
                let peers = vec![wire::PeerInfo { machine_id: session.machine_id.clone(), alive: true }];
                json_response(200, &peers)
            }

            ("POST", ["publish", topic @ ..]) if !topic.is_empty() => {
                let subject = topic.join(".");
                match session.broker.publish(&subject, Vec::new(), cx.body.clone()).await {
                    Ok(()) => Response::new(204),
                    Err(err) => {
                        warn!(%err, %subject, "rpc publish failed");
                        return Err(EdgeError::broker_unavailable());
                    }
                }
            }

            ("POST", ["reload"]) => {
                let params: wire::ReloadParams = parse_body(&cx.body)?;
                match session.reload(params.invalidate).await {
                    Ok(()) => Response::new(204),
                    Err(err) => {
                        // Previous manifest keeps serving.
                        return Err(EdgeError::new(
                            500,
                            pm3_core::ErrorKind::Internal,
                            "Reload Failed",
                        )
                        .explain(err.to_string()));
                    }
                }
            }

            ("GET", ["service"]) => {
                let list: wire::ServiceList = session
                    .services
                    .snapshot()
                    .iter()
                    .map(|(name, state)| (name.clone(), state.run_id.clone()))
                    .collect();
                json_response(200, &list)
            }

            ("GET", ["service", "health", name]) => match session.services.get(name) {
                Some(state) => json_response(200, &health_of(name, &state)),
                None => Response::new(404),
            },

            ("GET", ["service", "metrics", name]) => match session.services.get(name) {
                Some(state) => json_response(200, &metrics_of(name, &state)),
                None => Response::new(404),
            },

            ("GET", ["service", "info", name]) => match session.services.get(name) {
                Some(state) => {
                    let kind = match &state.instance {
                        ServiceInstance::FileServer(_) => "file-server",
                        ServiceInstance::Cluster(_) => "cluster",
                        ServiceInstance::Passive => "passive",
                    };
                    let info = wire::ServiceInfo {
                        name: name.to_string(),
                        run_id: state.run_id.clone(),
                        kind: kind.to_string(),
                        handler: state.describe(),
                        start_error: state.start_error.clone(),
                    };
                    json_response(200, &info)
                }
                None => Response::new(404),
            },

            ("POST", ["service", "restart"]) => {
                let params: wire::ReloadParams = parse_body(&cx.body)?;
                restart(&session, None, params.invalidate).await?
            }

            ("POST", ["service", "restart", name]) => {
                let params: wire::ReloadParams = parse_body(&cx.body)?;
                restart(&session, Some(name), params.invalidate).await?
            }

            ("POST", ["service", "stop"]) => {
                for name in session.services.snapshot().keys().cloned().collect::<Vec<_>>() {
                    session.stop_service(&name).await;
                }
                Response::new(204)
            }

            ("POST", ["service", "stop", name]) => {
                if session.stop_service(name).await {
                    Response::new(204)
                } else {
                    Response::new(404)
                }
            }

            (_, ["kv", rest @ ..]) => kv_op(&session, &method, rest, &cx.body).await?,

            ("POST", ["tail"]) => {
                let opts: wire::TailOptions = serde_json::from_slice(&cx.body).map_err(|e| {
                    EdgeError::new(400, pm3_core::ErrorKind::PermanentUpstream, "Bad Request")
                        .explain(e.to_string())
                })?;
                let log = ServiceLog::open(&session.dirs.logs, opts.service.as_str())
                    .and_then(|log| log.tail(opts.lines));
                match log {
                    Ok(lines) => Response::with_body(200, "text/plain", lines.join("\n")),
                    Err(_) => Response::new(404),
                }
            }

            ("GET", ["system"]) => json_response(200, &system_report()),

            ("GET", ["session"]) => {
                let report = wire::SessionReport {
                    tracked_sessions: session.sessions.len(),
                    services: session.services.len(),
                    runners: session.runner_count(),
                };
                json_response(200, &report)
            }

            _ => Response::new(404),
        };

        Ok(cx.respond(response))
    }

    fn describe(&self) -> String {
        "rpc".to_string()
    }
}

async fn restart(
    session: &Arc<DaemonSession>,
    name: Option<&str>,
    invalidate: bool,
) -> Result<Response, EdgeError> {
    match session.restart_service(name, invalidate).await {
        Ok(()) => Ok(Response::new(204)),
        Err(err) => Err(EdgeError::new(500, pm3_core::ErrorKind::Internal, "Restart Failed")
            .explain(err.to_string())),
    }
}

/// Broker KV passthrough plus the JSON-diff CAS.
async fn kv_op(
    session: &Arc<DaemonSession>,
    method: &http::Method,
    rest: &[&str],
    body: &Bytes,
) -> Result<Response, EdgeError> {
    let kv = session
        .broker
        .kv(KV_GLOBAL)
        .await
        .map_err(|_| EdgeError::broker_unavailable())?;

    match (method.as_str(), rest) {
        ("GET", [key]) => match kv.get(key).await {
            Ok(Some(entry)) => Ok(Response::with_body(200, "application/octet-stream", entry.value)),
            Ok(None) => Ok(Response::new(404)),
            Err(_) => Err(EdgeError::broker_unavailable()),
        },
        ("PUT" | "POST", [key]) => match kv.put(key, body.clone()).await {
            Ok(_) => Ok(Response::new(204)),
            Err(_) => Err(EdgeError::broker_unavailable()),
        },
        ("DELETE", [key]) => match kv.delete(key).await {
            Ok(()) => Ok(Response::new(204)),
            Err(_) => Err(EdgeError::broker_unavailable()),
        },
        ("POST", [key, "cas"]) => {
            let cas: wire::KvCas = serde_json::from_slice(body).map_err(|e| {
                EdgeError::new(400, pm3_core::ErrorKind::PermanentUpstream, "Bad Request")
                    .explain(e.to_string())
            })?;
            let current = kv.get(key).await.map_err(|_| EdgeError::broker_unavailable())?;
            let (current_json, revision) = match &current {
                Some(entry) => (
                    serde_json::from_slice(&entry.value).unwrap_or(serde_json::Value::Null),
                    entry.revision,
                ),
                None => (serde_json::Value::Null, 0),
            };
            // JSON-level equality, not byte equality.
            if current_json != cas.expected {
                return Ok(json_response(409, &current_json));
            }
            let desired = Bytes::from(cas.desired.to_string());
            let written = match revision {
                0 => kv.create(key, desired).await,
                rev => kv.update(key, desired, rev).await,
            };
            match written {
                Ok(_) => Ok(Response::new(204)),
                Err(_) => Ok(json_response(409, &current_json)),
            }
        }
        _ => Ok(Response::new(404)),
    }
}

fn health_of(name: &str, state: &Arc<pm3_supervisor::ServiceState>) -> wire::ServiceHealth {
    let instances = match &state.instance {
        ServiceInstance::Cluster(cluster) => cluster
            .processes()
            .iter()
            .map(|p| wire::InstanceHealth {
                pid: p.pid,
                addr: p.addr.clone(),
                healthy: p.healthy(),
                terminating: p.terminating(),
            })
            .collect(),
        _ => Vec::new(),
    };
    wire::ServiceHealth { name: name.to_string(), healthy: state.healthy(), instances }
}

fn metrics_of(name: &str, state: &Arc<pm3_supervisor::ServiceState>) -> wire::ServiceMetrics {
    let mut metrics = wire::ServiceMetrics { name: name.to_string(), ..Default::default() };
    if let ServiceInstance::Cluster(cluster) = &state.instance {
        let mut system = System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        for proc_ in cluster.processes() {
            metrics.instances += 1;
            let tree = ProcessTree::collect(&system, proc_.pid);
            let tree_metrics = tree.metrics(&system, Some(cluster.cpu_history()));
            metrics.rss_bytes += tree_metrics.rss_bytes;
            metrics.cpu_percent += tree_metrics.cpu_percent;
            metrics.requests += proc_.upstream.requests.load(std::sync::atomic::Ordering::Relaxed);
            metrics.status_4xx +=
                proc_.upstream.status_4xx.load(std::sync::atomic::Ordering::Relaxed);
            metrics.status_5xx +=
                proc_.upstream.status_5xx.load(std::sync::atomic::Ordering::Relaxed);
            metrics.errors += proc_.upstream.errors.load(std::sync::atomic::Ordering::Relaxed);
        }
    }
    metrics
}

fn system_report() -> wire::SystemReport {
    let mut system = System::new_all();
    system.refresh_memory();
    wire::SystemReport {
        cpus: system.cpus().len(),
        memory_total: system.total_memory(),
        memory_used: system.used_memory(),
        load_one: System::load_average().one,
        uptime_secs: System::uptime(),
    }
}

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod tests;
