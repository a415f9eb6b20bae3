// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tri-state handler pipeline.
//!
//! Every handler sees the whole exchange and answers with a [`Flow`]:
//! `Done` keeps the response and stops, `Continue` passes along, `Drop`
//! exits the pipeline as if nothing matched (and resets the connection if
//! it bubbles to the top-level dispatcher).

use crate::session::ClientSession;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version};
use pm3_core::{EdgeError, RayId};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("bad handler node: {0}")]
    BadHandler(String),

    #[error("bad directive {0:?}: {1}")]
    BadDirective(String, String),

    #[error("no constructor matched handler node")]
    NoMatch,

    #[error(transparent)]
    Pattern(#[from] crate::pattern::PatternError),

    #[error("tls: {0}")]
    Tls(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Tri-state pipeline result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Terminate the pipeline; the response stands.
    Done,
    /// Pass to the next handler.
    Continue,
    /// Exit this pipeline as if no match; reset the connection at top level.
    Drop,
}

/// Scheme the exchange arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// A buffered response under construction.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self { status, headers: HeaderMap::new(), body: Bytes::new() }
    }

    pub fn with_body(status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut resp = Self::new(status);
        if let Ok(value) = http::HeaderValue::from_str(content_type) {
            resp.headers.insert(http::header::CONTENT_TYPE, value);
        }
        resp.body = body.into();
        resp
    }
}

/// One in-flight exchange: the buffered request, the session, and the
/// response slot handlers fill in.
pub struct Exchange {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub scheme: Scheme,
    pub session: Arc<ClientSession>,
    pub ray: RayId,
    pub response: Option<Response>,
    /// Set when a handler asked for a hard connection reset.
    pub abort: bool,
    /// Portal restarts consumed by this exchange (at most one allowed).
    pub portal_hops: u8,
    /// Target of a pending portal restart.
    pub portal_to: Option<Uri>,
}

impl Exchange {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        scheme: Scheme,
        session: Arc<ClientSession>,
        ray: RayId,
    ) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers,
            body,
            scheme,
            session,
            ray,
            response: None,
            abort: false,
            portal_hops: 0,
            portal_to: None,
        }
    }

    pub fn host(&self) -> &str {
        self.headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h))
            .or_else(|| self.uri.host())
            .unwrap_or("")
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Replace the request path (and query), keeping everything else.
    pub fn set_path_and_query(&mut self, pq: &str) -> Result<(), EdgeError> {
        let mut parts = self.uri.clone().into_parts();
        parts.path_and_query = Some(pq.parse().map_err(|_| {
            EdgeError::new(400, pm3_core::ErrorKind::Internal, "Bad Rewrite")
                .explain(format!("rewrite produced an unparsable target {pq:?}"))
        })?);
        self.uri = Uri::from_parts(parts).map_err(|_| {
            EdgeError::new(400, pm3_core::ErrorKind::Internal, "Bad Rewrite")
        })?;
        Ok(())
    }

    pub fn respond(&mut self, response: Response) -> Flow {
        self.response = Some(response);
        Flow::Done
    }

    /// Whether any handler has touched the response.
    pub fn response_touched(&self) -> bool {
        self.response.is_some()
    }
}

/// The handler capability set: serve and describe yourself.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, EdgeError>;

    /// Human-readable form for logs and `view` output.
    fn describe(&self) -> String;
}

/// Resolves service names to their live HTTP handlers at request time.
/// Implemented by the daemon over its service map; indirection keeps
/// pipelines valid across service replacement.
pub trait ServiceDirectory: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Handler>>;
}

/// An ordered handler chain.
#[derive(Clone, Default)]
pub struct Pipeline {
    handlers: Vec<Arc<dyn Handler>>,
}

impl Pipeline {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        Self { handlers }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn describe(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.describe()).collect()
    }

    /// Run the chain under the tri-state discipline.
    pub async fn run(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        for handler in &self.handlers {
            match handler.serve(cx).await? {
                Flow::Continue => continue,
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Continue)
    }
}

#[async_trait]
impl Handler for Pipeline {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        self.run(cx).await
    }

    fn describe(&self) -> String {
        format!("pipeline[{}]", self.handlers.len())
    }
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
