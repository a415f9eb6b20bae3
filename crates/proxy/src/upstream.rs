// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One upstream endpoint: health flag, load counters, and the transport
//! the proxy forwards through.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// A live upstream. Owned by the service instance; the load balancer holds
/// shared pointers.
pub struct Upstream {
    /// `host:port` inside the service subnet.
    pub addr: String,
    healthy: AtomicBool,
    /// In-flight request count; draining waits for this to hit zero.
    load_factor: AtomicI64,
    pub requests: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    pub errors: AtomicU64,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Upstream {
    /// New upstream, initially unhealthy until the health monitor promotes it.
    pub fn new(addr: impl Into<String>) -> Arc<Self> {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(std::time::Duration::from_secs(30))
            .build_http();
        Arc::new(Self {
            addr: addr.into(),
            healthy: AtomicBool::new(false),
            load_factor: AtomicI64::new(0),
            requests: AtomicU64::new(0),
            status_4xx: AtomicU64::new(0),
            status_5xx: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            client,
        })
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn load_factor(&self) -> i64 {
        self.load_factor.load(Ordering::Relaxed)
    }

    /// Begin a request; the returned guard releases the slot on drop.
    pub fn begin(self: &Arc<Self>) -> RequestGuard {
        self.load_factor.fetch_add(1, Ordering::Relaxed);
        self.requests.fetch_add(1, Ordering::Relaxed);
        RequestGuard { upstream: Arc::clone(self) }
    }

    pub fn record_status(&self, status: u16) {
        match status {
            400..=499 => {
                self.status_4xx.fetch_add(1, Ordering::Relaxed);
            }
            500..=599 => {
                self.status_5xx.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Forward a buffered request, returning the buffered response.
    pub async fn forward(
        &self,
        method: http::Method,
        path_and_query: &str,
        headers: &http::HeaderMap,
        body: Bytes,
    ) -> Result<crate::handler::Response, UpstreamError> {
        let uri: http::Uri = format!("http://{}{}", self.addr, path_and_query)
            .parse()
            .map_err(|_| UpstreamError::BadTarget(path_and_query.to_string()))?;

        let mut builder = http::Request::builder().method(method).uri(uri);
        if let Some(out_headers) = builder.headers_mut() {
            for (name, value) in headers {
                out_headers.append(name.clone(), value.clone());
            }
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| UpstreamError::BadTarget(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?
            .to_bytes();

        self.record_status(status);
        Ok(crate::handler::Response { status, headers, body })
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("addr", &self.addr)
            .field("healthy", &self.healthy())
            .field("load", &self.load_factor())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("bad forward target {0:?}")]
    BadTarget(String),

    #[error("upstream transport: {0}")]
    Transport(String),
}

/// Load-factor guard; lives for the duration of one forwarded request.
pub struct RequestGuard {
    upstream: Arc<Upstream>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.upstream.load_factor.fetch_sub(1, Ordering::Relaxed);
    }
}
