// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Handler registry.
//!
//! Manifest handler nodes become live handlers here. A node with an
//! explicit `!Tag` goes straight to that constructor; tag-less nodes are
//! trial-unmarshalled in registration order, each constructor rejecting
//! with a sentinel no-match until one claims the node. Tags are data, not
//! language types: `Switch-<var>` is a tag family, not an enum.

use crate::directive::parse_directive;
use crate::handler::{Exchange, Flow, Handler, Pipeline, Response, ServiceDirectory};
use crate::limiter::{enforce, LimitOutcome};
use crate::pattern::Pattern;
use crate::ProxyError;
use async_trait::async_trait;
use bytes::Bytes;
use pm3_broker::BrokerClient;
use pm3_core::{EdgeError, RateLimit};
use serde_yaml::Value;
use std::sync::Arc;

/// Everything constructors may need.
#[derive(Clone)]
pub struct RegistryEnv {
    pub services: Arc<dyn ServiceDirectory>,
    pub broker: Arc<dyn BrokerClient>,
}

/// Build one handler from a manifest node.
pub fn build_handler(node: &Value, env: &RegistryEnv) -> Result<Arc<dyn Handler>, ProxyError> {
    if let Value::Tagged(tagged) = node {
        let tag = tagged.tag.to_string();
        let tag = tag.trim_start_matches('!');
        return build_tagged(tag, &tagged.value, env);
    }

    // Trial-unmarshal: constructors reject with NoMatch until one claims it.
    if let Value::String(raw) = node {
        match parse_directive(raw) {
            Err(ProxyError::NoMatch) => {}
            result => return result,
        }
        // A bare scalar that is no directive reads as `Service <name>`.
        return Ok(service_handler(raw.trim(), env));
    }

    if let Value::Mapping(map) = node {
        if map.contains_key(&Value::from("from")) && map.contains_key(&Value::from("to")) {
            return rewrite_from_value(node);
        }
        return mux_from_value(node, env);
    }

    Err(ProxyError::BadHandler(format!("unusable handler node: {node:?}")))
}

/// Build a pipeline from an ordered list of nodes.
pub fn build_pipeline(nodes: &[Value], env: &RegistryEnv) -> Result<Pipeline, ProxyError> {
    let handlers = nodes
        .iter()
        .map(|node| build_handler(node, env))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Pipeline::new(handlers))
}

fn build_tagged(tag: &str, value: &Value, env: &RegistryEnv) -> Result<Arc<dyn Handler>, ProxyError> {
    if let Some(var) = tag.strip_prefix("Switch-") {
        return switch_from_value(var, value, env);
    }
    match tag {
        "Rewrite" => rewrite_from_value(value),
        "Limit" => limit_from_value(value),
        "Service" => {
            let name = value
                .as_str()
                .ok_or_else(|| ProxyError::BadHandler("Service expects a name".into()))?;
            Ok(service_handler(name, env))
        }
        "Publish" => {
            let subject = value
                .as_str()
                .ok_or_else(|| ProxyError::BadHandler("Publish expects a subject".into()))?;
            Ok(Arc::new(PublishHandler {
                subject: subject.to_string(),
                broker: Arc::clone(&env.broker),
            }))
        }
        "Mux" => mux_from_value(value, env),
        "Internal" => Ok(Arc::new(InternalHandler)),
        other => Err(ProxyError::BadHandler(format!("unknown handler tag {other:?}"))),
    }
}

fn service_handler(name: &str, env: &RegistryEnv) -> Arc<dyn Handler> {
    Arc::new(ServiceHandler { name: name.to_string(), services: Arc::clone(&env.services) })
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Routes into a named service's live handler. Resolution happens per
/// request so pipelines survive service replacement.
struct ServiceHandler {
    name: String,
    services: Arc<dyn ServiceDirectory>,
}

#[async_trait]
impl Handler for ServiceHandler {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        match self.services.lookup(&self.name) {
            Some(handler) => handler.serve(cx).await,
            None => Err(EdgeError::new(
                503,
                pm3_core::ErrorKind::TransientUpstream,
                "Service Unavailable",
            )
            .explain(format!("service {:?} is not running", self.name))),
        }
    }

    fn describe(&self) -> String {
        format!("Service {}", self.name)
    }
}

// ---------------------------------------------------------------------------
// Limit
// ---------------------------------------------------------------------------

struct LimitHandler {
    limit: RateLimit,
}

fn limit_from_value(value: &Value) -> Result<Arc<dyn Handler>, ProxyError> {
    let raw = value
        .as_str()
        .ok_or_else(|| ProxyError::BadHandler("Limit expects a spec string".into()))?;
    let limit: RateLimit = raw
        .parse()
        .map_err(|e| ProxyError::BadHandler(format!("Limit {raw:?}: {e}")))?;
    Ok(Arc::new(LimitHandler { limit }))
}

#[async_trait]
impl Handler for LimitHandler {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        match enforce(&cx.session, &self.limit, now_ms) {
            LimitOutcome::Allow => Ok(Flow::Continue),
            LimitOutcome::Throttle { retry_after } => {
                Ok(cx.respond(throttle_response(retry_after.as_secs().max(1))))
            }
            LimitOutcome::Block { until_ms } => {
                // The block gate at server entry answers 1021 from here on;
                // this request still gets the throttle shape.
                let secs = until_ms.saturating_sub(now_ms) / 1000;
                Ok(cx.respond(throttle_response(secs.max(1))))
            }
        }
    }

    fn describe(&self) -> String {
        format!("Limit {}", self.limit)
    }
}

fn throttle_response(retry_after_secs: u64) -> Response {
    let mut resp = Response::new(429);
    if let Ok(v) = http::HeaderValue::from_str(&retry_after_secs.to_string()) {
        resp.headers.insert(http::header::RETRY_AFTER, v);
    }
    resp
}

// ---------------------------------------------------------------------------
// Rewrite
// ---------------------------------------------------------------------------

/// Regex path rewrite: `!Rewrite { from: <regex>, to: <template> }`.
struct RewriteHandler {
    from: regex::Regex,
    to: String,
}

fn rewrite_from_value(value: &Value) -> Result<Arc<dyn Handler>, ProxyError> {
    #[derive(serde::Deserialize)]
    struct Raw {
        from: String,
        to: String,
    }
    let raw: Raw = serde_yaml::from_value(value.clone())
        .map_err(|e| ProxyError::BadHandler(format!("Rewrite: {e}")))?;
    let from = regex::Regex::new(&raw.from)
        .map_err(|e| ProxyError::BadHandler(format!("Rewrite {:?}: {e}", raw.from)))?;
    Ok(Arc::new(RewriteHandler { from, to: raw.to }))
}

#[async_trait]
impl Handler for RewriteHandler {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        let path = cx.path().to_string();
        if self.from.is_match(&path) {
            let rewritten = self.from.replace(&path, self.to.as_str()).into_owned();
            cx.set_path_and_query(&rewritten)?;
        }
        Ok(Flow::Continue)
    }

    fn describe(&self) -> String {
        format!("Rewrite {} -> {}", self.from, self.to)
    }
}

// ---------------------------------------------------------------------------
// Publish
// ---------------------------------------------------------------------------

struct PublishHandler {
    subject: String,
    broker: Arc<dyn BrokerClient>,
}

#[async_trait]
impl Handler for PublishHandler {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        let payload: Bytes = cx.body.clone();
        match self.broker.publish(&self.subject, Vec::new(), payload).await {
            Ok(()) => Ok(cx.respond(Response::new(204))),
            Err(err) => {
                tracing::warn!(subject = %self.subject, %err, ray = %cx.ray, "publish failed");
                Err(EdgeError::broker_unavailable())
            }
        }
    }

    fn describe(&self) -> String {
        format!("Publish {}", self.subject)
    }
}

// ---------------------------------------------------------------------------
// Mux
// ---------------------------------------------------------------------------

/// Ordered pattern -> pipeline table. First matching entry runs; `Drop`
/// from inside exits the whole mux as a non-match.
struct MuxHandler {
    routes: Vec<(Pattern, Pipeline)>,
}

fn mux_from_value(value: &Value, env: &RegistryEnv) -> Result<Arc<dyn Handler>, ProxyError> {
    let map = value
        .as_mapping()
        .ok_or_else(|| ProxyError::BadHandler("Mux expects a mapping".into()))?;
    let mut routes = Vec::with_capacity(map.len());
    for (key, node) in map {
        let pattern_text = key
            .as_str()
            .ok_or_else(|| ProxyError::BadHandler("Mux keys must be pattern strings".into()))?;
        let pattern = Pattern::parse(pattern_text)?;
        let pipeline = match node {
            Value::Sequence(nodes) => build_pipeline(nodes, env)?,
            single => Pipeline::new(vec![build_handler(single, env)?]),
        };
        routes.push((pattern, pipeline));
    }
    Ok(Arc::new(MuxHandler { routes }))
}

#[async_trait]
impl Handler for MuxHandler {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        let host = cx.host().to_string();
        let path = cx.path().to_string();
        for (pattern, pipeline) in &self.routes {
            if !pattern.matches(&host, &path) {
                continue;
            }
            match pipeline.run(cx).await? {
                Flow::Continue => continue,
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Continue)
    }

    fn describe(&self) -> String {
        format!("Mux[{}]", self.routes.len())
    }
}

// ---------------------------------------------------------------------------
// Switch
// ---------------------------------------------------------------------------

/// `!Switch-<var>`: dispatch on a request variable instead of host+path.
struct SwitchHandler {
    var: String,
    routes: Vec<(Pattern, Pipeline)>,
}

fn switch_from_value(var: &str, value: &Value, env: &RegistryEnv) -> Result<Arc<dyn Handler>, ProxyError> {
    let map = value
        .as_mapping()
        .ok_or_else(|| ProxyError::BadHandler(format!("Switch-{var} expects a mapping")))?;
    let mut routes = Vec::with_capacity(map.len());
    for (key, node) in map {
        let pattern_text = key
            .as_str()
            .ok_or_else(|| ProxyError::BadHandler("Switch keys must be pattern strings".into()))?;
        let pattern = Pattern::parse(pattern_text)?;
        let pipeline = match node {
            Value::Sequence(nodes) => build_pipeline(nodes, env)?,
            single => Pipeline::new(vec![build_handler(single, env)?]),
        };
        routes.push((pattern, pipeline));
    }
    Ok(Arc::new(SwitchHandler { var: var.to_ascii_lowercase(), routes }))
}

impl SwitchHandler {
    fn value_of(&self, cx: &Exchange) -> String {
        match self.var.as_str() {
            "host" => cx.host().to_string(),
            "path" => cx.path().to_string(),
            "method" => cx.method.as_str().to_string(),
            "scheme" => cx.scheme.as_str().to_string(),
            other => cx
                .session
                .vars
                .get(other)
                .map(|v| v.value().clone())
                .or_else(|| {
                    cx.headers
                        .get(other)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                })
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Handler for SwitchHandler {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        let value = self.value_of(cx);
        for (pattern, pipeline) in &self.routes {
            if !pattern.matches(&value, "") {
                continue;
            }
            match pipeline.run(cx).await? {
                Flow::Continue => continue,
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Continue)
    }

    fn describe(&self) -> String {
        format!("Switch-{}[{}]", self.var, self.routes.len())
    }
}

// ---------------------------------------------------------------------------
// Internal
// ---------------------------------------------------------------------------

/// Gate: only local sessions or proven-internal requests pass.
struct InternalHandler;

#[async_trait]
impl Handler for InternalHandler {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        let proven = cx
            .headers
            .get(crate::INTERNAL_HEADER)
            .and_then(|v| v.to_str().ok())
            == Some("1");
        if proven || cx.session.local {
            Ok(Flow::Continue)
        } else {
            Ok(Flow::Drop)
        }
    }

    fn describe(&self) -> String {
        "Internal".to_string()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
