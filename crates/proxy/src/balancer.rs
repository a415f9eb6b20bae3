// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry-aware load balancer.
//!
//! Strategy picks an upstream; the retrier re-dispatches transient
//! failures to a different one until the budget runs out. Sticky sessions
//! pin a client to its last good upstream while that upstream stays
//! healthy.

use crate::handler::{Exchange, Flow, Handler, Response};
use crate::limiter::{enforce, LimitOutcome};
use crate::upstream::{Upstream, UpstreamError};
use async_trait::async_trait;
use parking_lot::RwLock;
use pm3_core::{EdgeError, RateLimit};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Upstream selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Lowest in-flight load; falls back to unhealthy upstreams when none
    /// are healthy.
    LeastConn,
    #[default]
    Random,
    /// Client-ip hash; local sessions round-robin instead.
    Hash,
    RoundRobin,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "least-conn" => Some(Self::LeastConn),
            "random" => Some(Self::Random),
            "hash" => Some(Self::Hash),
            "round-robin" => Some(Self::RoundRobin),
            _ => None,
        }
    }
}

/// Retry budget and which methods consume it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Re-dispatches allowed after the first attempt.
    pub budget: u32,
    /// Methods eligible for retry (idempotent only).
    pub methods: Vec<http::Method>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { budget: 2, methods: vec![http::Method::GET] }
    }
}

impl RetryPolicy {
    fn method_retryable(&self, method: &http::Method) -> bool {
        self.methods.contains(method)
    }
}

/// Optional per-status-class hook: rate-limit the offender, serve a custom
/// body, or override retriability.
#[derive(Debug, Clone, Default)]
pub struct StatusPolicy {
    pub limit: Option<RateLimit>,
    pub body: Option<String>,
    pub retry: Option<bool>,
}

/// See module docs.
pub struct LoadBalancer {
    /// Stable per-construction id; sticky slots key on it.
    id: String,
    strategy: Strategy,
    sticky: bool,
    retry: RetryPolicy,
    pub on_404: Option<StatusPolicy>,
    pub on_4xx: Option<StatusPolicy>,
    pub on_5xx: Option<StatusPolicy>,
    upstreams: RwLock<Vec<Arc<Upstream>>>,
    rr: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy, sticky: bool, retry: RetryPolicy) -> Arc<Self> {
        Self::with_policies(strategy, sticky, retry, None, None, None)
    }

    pub fn with_policies(
        strategy: Strategy,
        sticky: bool,
        retry: RetryPolicy,
        on_404: Option<StatusPolicy>,
        on_4xx: Option<StatusPolicy>,
        on_5xx: Option<StatusPolicy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: format!("lb-{}", nanoid::nanoid!(8)),
            strategy,
            sticky,
            retry,
            on_404,
            on_4xx,
            on_5xx,
            upstreams: RwLock::new(Vec::new()),
            rr: AtomicUsize::new(0),
        })
    }

    pub fn add(&self, upstream: Arc<Upstream>) {
        self.upstreams.write().push(upstream);
    }

    pub fn remove(&self, upstream: &Arc<Upstream>) {
        self.upstreams
            .write()
            .retain(|u| !Arc::ptr_eq(u, upstream));
    }

    pub fn snapshot(&self) -> Vec<Arc<Upstream>> {
        self.upstreams.read().clone()
    }

    pub fn len(&self) -> usize {
        self.upstreams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.read().is_empty()
    }

    /// Pick an upstream. `exclude` marks a known-bad upstream from a prior
    /// attempt, which also forces the random strategy.
    pub fn pick(
        &self,
        session: &crate::session::ClientSession,
        exclude: Option<&Arc<Upstream>>,
    ) -> Option<Arc<Upstream>> {
        // Snapshot under the read lock; selection happens outside it.
        let all = self.snapshot();

        if self.sticky && exclude.is_none() {
            if let Some(slot) = session.sticky.get(&self.id) {
                if let Some(pinned) = slot.upgrade() {
                    if pinned.healthy() {
                        return Some(pinned);
                    }
                }
            }
        }

        let candidates: Vec<&Arc<Upstream>> = all
            .iter()
            .filter(|u| exclude.map_or(true, |bad| !Arc::ptr_eq(u, bad)))
            .collect();
        let healthy: Vec<&Arc<Upstream>> =
            candidates.iter().filter(|u| u.healthy()).copied().collect();

        let strategy = if exclude.is_some() { Strategy::Random } else { self.strategy };

        let pool: &[&Arc<Upstream>] = if !healthy.is_empty() {
            &healthy
        } else if strategy == Strategy::LeastConn && !candidates.is_empty() {
            // least-conn serves through unhealthy upstreams rather than fail.
            &candidates
        } else {
            return None;
        };

        let chosen = match strategy {
            Strategy::LeastConn => pool
                .iter()
                .min_by_key(|u| u.load_factor())
                .copied(),
            Strategy::Random => {
                let k = rand::random::<usize>() % pool.len();
                pool.get(k).copied()
            }
            Strategy::Hash => {
                let k = if session.local {
                    self.rr.fetch_add(1, Ordering::Relaxed)
                } else {
                    session.ip_hash as usize
                };
                pool.get(k % pool.len()).copied()
            }
            Strategy::RoundRobin => {
                let k = self.rr.fetch_add(1, Ordering::Relaxed);
                pool.get(k % pool.len()).copied()
            }
        };
        chosen.cloned()
    }

    fn pin(&self, session: &crate::session::ClientSession, upstream: &Arc<Upstream>) {
        if self.sticky {
            session
                .sticky
                .insert(self.id.clone(), Arc::downgrade(upstream));
        }
    }

    fn unpin(&self, session: &crate::session::ClientSession, upstream: &Arc<Upstream>) {
        if self.sticky {
            // Clear only if the slot still holds the failed upstream.
            session.sticky.remove_if(&self.id, |_, slot| {
                slot.upgrade().is_some_and(|held| Arc::ptr_eq(&held, upstream))
            });
        }
    }

    fn policy_for(&self, status: u16) -> Option<&StatusPolicy> {
        match status {
            404 => self.on_404.as_ref().or(self.on_4xx.as_ref()),
            400..=499 => self.on_4xx.as_ref(),
            500..=599 => self.on_5xx.as_ref(),
            _ => None,
        }
    }

    /// Apply a status hook; may replace the response outright.
    fn apply_policy(
        &self,
        cx: &mut Exchange,
        policy: &StatusPolicy,
        response: &mut Response,
        now_ms: u64,
    ) {
        if let Some(limit) = &policy.limit {
            match enforce(&cx.session, limit, now_ms) {
                LimitOutcome::Allow => {}
                LimitOutcome::Throttle { retry_after } => {
                    let mut resp = Response::new(429);
                    if let Ok(v) = http::HeaderValue::from_str(&retry_after.as_secs().max(1).to_string()) {
                        resp.headers.insert(http::header::RETRY_AFTER, v);
                    }
                    *response = resp;
                    return;
                }
                LimitOutcome::Block { .. } => {
                    *response = Response::new(429);
                    return;
                }
            }
        }
        if let Some(body) = &policy.body {
            response.body = bytes::Bytes::from(body.clone());
        }
    }

    /// Forward with retries. The caller owns error-page rendering; this
    /// returns `Err` only once the budget is spent.
    pub async fn dispatch(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let path_and_query = cx
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let mut budget = self.retry.budget;
        let mut bad: Option<Arc<Upstream>> = None;

        loop {
            let Some(upstream) = self.pick(&cx.session, bad.as_ref()) else {
                return Err(EdgeError::upstream_unavailable());
            };

            let guard = upstream.begin();
            let result = upstream
                .forward(cx.method.clone(), &path_and_query, &cx.headers, cx.body.clone())
                .await;
            drop(guard);

            match result {
                Err(UpstreamError::BadTarget(t)) => {
                    return Err(EdgeError::new(400, pm3_core::ErrorKind::Internal, "Bad Request")
                        .explain(format!("unforwardable target {t:?}")));
                }
                Err(UpstreamError::Transport(reason)) => {
                    upstream.record_error();
                    self.unpin(&cx.session, &upstream);
                    tracing::debug!(addr = %upstream.addr, %reason, ray = %cx.ray, "upstream transport error");
                    if budget > 0 && self.retry.method_retryable(&cx.method) && self.len() > 1 {
                        budget -= 1;
                        bad = Some(upstream);
                        continue;
                    }
                    return Err(EdgeError::upstream_unavailable());
                }
                Ok(mut response) => {
                    // 444 means: abort the client connection, discard the body.
                    if response.status == 444 {
                        cx.abort = true;
                        return Ok(Flow::Drop);
                    }

                    if (500..=599).contains(&response.status) {
                        self.unpin(&cx.session, &upstream);
                        let retriable = self
                            .policy_for(response.status)
                            .and_then(|p| p.retry)
                            .unwrap_or_else(|| self.retry.method_retryable(&cx.method));
                        if retriable {
                            if budget > 0 && self.len() > 1 {
                                budget -= 1;
                                bad = Some(upstream);
                                continue;
                            }
                            return Err(EdgeError::upstream_unavailable());
                        }
                        if let Some(policy) = self.policy_for(response.status).cloned() {
                            self.apply_policy(cx, &policy, &mut response, now_ms);
                        }
                        return Ok(cx.respond(response));
                    }

                    if (400..=499).contains(&response.status) {
                        // Client faults are passed through, never retried,
                        // never logged as server errors.
                        if let Some(policy) = self.policy_for(response.status).cloned() {
                            self.apply_policy(cx, &policy, &mut response, now_ms);
                        }
                        return Ok(cx.respond(response));
                    }

                    self.pin(&cx.session, &upstream);
                    return Ok(cx.respond(response));
                }
            }
        }
    }
}

#[async_trait]
impl Handler for LoadBalancer {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        self.dispatch(cx).await
    }

    fn describe(&self) -> String {
        format!("balancer[{:?} n={}]", self.strategy, self.len())
    }
}

#[cfg(test)]
#[path = "balancer_tests.rs"]
mod tests;
