// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Proxy server: request entry, panic fence, portal restarts, error pages.

use crate::directive::clean_path;
use crate::errorpage::{render_error, ErrorContext, ErrorTemplates};
use crate::handler::{Exchange, Flow, Handler, Response, Scheme};
use crate::session::SessionTable;
use crate::signed::{strip_signature, verify_signed, SignedVerdict};
use crate::tls::{CertStore, SniResolver};
use crate::vhost::VhostRouter;
use crate::{ProxyError, INTERNAL_HEADER, RAY_HEADER, RPC_HOST};
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures_util::FutureExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use pm3_core::{new_ray_id, EdgeError, SystemClock};
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub http_port: u16,
    pub https_port: u16,
}

/// Sentinel error telling hyper to tear the connection down without a
/// response (our "connection reset").
#[derive(Debug)]
pub struct AbortConnection;

impl std::fmt::Display for AbortConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("connection aborted")
    }
}

impl std::error::Error for AbortConnection {}

/// Sized wrapper so the trait object can live behind an `ArcSwapOption`,
/// which requires its payload to be `Sized`.
struct RpcHandler(Arc<dyn Handler>);

impl std::ops::Deref for RpcHandler {
    type Target = dyn Handler;
    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

/// The node's HTTP front door.
pub struct ProxyServer {
    pub router: Arc<VhostRouter>,
    pub sessions: Arc<SessionTable<SystemClock>>,
    pub templates: Arc<ErrorTemplates>,
    pub certs: Arc<CertStore>,
    secret: Vec<u8>,
    config: ServerConfig,
    /// Handler for the reserved RPC host; installed by the reconciler.
    rpc: ArcSwapOption<RpcHandler>,
}

impl ProxyServer {
    pub fn new(
        config: ServerConfig,
        secret: Vec<u8>,
        sessions: Arc<SessionTable<SystemClock>>,
        certs: Arc<CertStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            router: Arc::new(VhostRouter::new()),
            sessions,
            templates: Arc::new(ErrorTemplates::new()),
            certs,
            secret,
            config,
            rpc: ArcSwapOption::empty(),
        })
    }

    pub fn set_rpc_handler(&self, handler: Arc<dyn Handler>) {
        self.rpc.store(Some(Arc::new(RpcHandler(handler))));
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Bind both listeners. Separated from [`Self::serve`] so callers (and
    /// tests) can learn the bound addresses before traffic starts.
    pub async fn bind(&self) -> Result<(TcpListener, TcpListener), ProxyError> {
        let http_addr: SocketAddr = format!("{}:{}", self.config.bind, self.config.http_port)
            .parse()
            .map_err(|e| ProxyError::BadHandler(format!("bind address: {e}")))?;
        let https_addr: SocketAddr = format!("{}:{}", self.config.bind, self.config.https_port)
            .parse()
            .map_err(|e| ProxyError::BadHandler(format!("bind address: {e}")))?;
        let http = TcpListener::bind(http_addr).await?;
        let https = TcpListener::bind(https_addr).await?;
        info!(http = %http.local_addr()?, https = %https.local_addr()?, "proxy listening");
        Ok((http, https))
    }

    /// Run both listeners until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ProxyError> {
        let (http, https) = self.bind().await?;
        self.serve(http, https, cancel).await
    }

    /// Accept loop over pre-bound listeners.
    pub async fn serve(
        self: Arc<Self>,
        http: TcpListener,
        https: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ProxyError> {
        let mut tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniResolver {
                router: Arc::clone(&self.router),
                store: Arc::clone(&self.certs),
            }));
        tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = http.accept() => {
                    let Ok((stream, peer)) = accepted else { continue };
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.serve_plain(stream, peer.ip()).await;
                    });
                }
                accepted = https.accept() => {
                    let Ok((stream, peer)) = accepted else { continue };
                    let server = Arc::clone(&self);
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls) => server.serve_tls(tls, peer.ip()).await,
                            Err(err) => debug!(%err, "tls handshake failed"),
                        }
                    });
                }
            }
        }
    }

    async fn serve_plain(self: Arc<Self>, stream: tokio::net::TcpStream, peer: IpAddr) {
        let io = TokioIo::new(stream);
        let server = Arc::clone(&self);
        let service = service_fn(move |req| {
            let server = Arc::clone(&server);
            async move { server.handle(peer, Scheme::Http, req).await }
        });
        if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(io, service)
            .await
        {
            debug!(%err, "connection ended");
        }
    }

    async fn serve_tls(
        self: Arc<Self>,
        stream: tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
        peer: IpAddr,
    ) {
        let io = TokioIo::new(stream);
        let server = Arc::clone(&self);
        let service = service_fn(move |req| {
            let server = Arc::clone(&server);
            async move { server.handle(peer, Scheme::Https, req).await }
        });
        if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(io, service)
            .await
        {
            debug!(%err, "tls connection ended");
        }
    }

    /// Full entry sequence for one request.
    pub async fn handle(
        self: Arc<Self>,
        peer: IpAddr,
        scheme: Scheme,
        req: http::Request<Incoming>,
    ) -> Result<http::Response<Full<Bytes>>, AbortConnection> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return Err(AbortConnection),
        };

        let session = self.sessions.start_request(peer, &parts.headers);
        let ray = new_ray_id();

        let host = parts
            .headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_string())
            .or_else(|| parts.uri.host().map(str::to_string))
            .unwrap_or_default();

        // `OPTIONS *` is answered before any routing.
        if parts.method == http::Method::OPTIONS && parts.uri.path() == "*" {
            return Ok(plain_response(Response::new(204), &ray));
        }

        let is_rpc = host == RPC_HOST;
        if !is_rpc && !self.router.knows_host(&host) {
            debug!(%host, %peer, "unknown host; resetting");
            return Err(AbortConnection);
        }

        let err_cx = ErrorContext { host: &host, ray: &ray, client_ip: session.ip };
        let accept = parts
            .headers
            .get(http::header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        if session.blocked(now_ms) {
            let page = render_error(&EdgeError::blocked(), &err_cx, accept.as_deref(), &self.templates);
            return Ok(plain_response(page, &ray));
        }

        // Clean the path and verify any signature before handlers see it.
        let mut headers = parts.headers;
        let path = clean_path(parts.uri.path());
        let query = parts.uri.query().unwrap_or("");
        let now_secs = now_ms / 1000;
        let query = match verify_signed(&self.secret, &path, query, now_secs) {
            SignedVerdict::Unsigned => query.to_string(),
            SignedVerdict::Valid => {
                if let Ok(v) = http::HeaderValue::from_str("1") {
                    headers.insert(INTERNAL_HEADER, v);
                }
                strip_signature(query)
            }
            SignedVerdict::Invalid => {
                let page = render_error(
                    &EdgeError::bad_signature(),
                    &err_cx,
                    accept.as_deref(),
                    &self.templates,
                );
                return Ok(plain_response(page, &ray));
            }
        };

        let path_and_query = if query.is_empty() { path.clone() } else { format!("{path}?{query}") };
        let uri: http::Uri = match path_and_query.parse() {
            Ok(uri) => uri,
            Err(_) => return Err(AbortConnection),
        };

        let mut cx = Exchange::new(
            parts.method.clone(),
            uri,
            headers,
            body,
            scheme,
            Arc::clone(&session),
            ray.clone(),
        );
        cx.version = parts.version;

        // Panic fence: exactly one around dispatch.
        let outcome = AssertUnwindSafe(self.dispatch(&mut cx, is_rpc)).catch_unwind().await;

        let flow = match outcome {
            Ok(flow) => flow,
            Err(_) => {
                warn!(ray = %ray, "handler panicked");
                if cx.response_touched() {
                    return Err(AbortConnection);
                }
                let page =
                    render_error(&EdgeError::panic(), &err_cx, accept.as_deref(), &self.templates);
                return Ok(plain_response(page, &ray));
            }
        };

        match flow {
            Ok(Flow::Done) if cx.abort => Err(AbortConnection),
            Ok(Flow::Done) => {
                let response = cx
                    .response
                    .take()
                    .unwrap_or_else(|| Response::new(200));
                let mut out = plain_response(response, &ray);
                for (name, value) in &session.info_headers {
                    if let (Ok(n), Ok(v)) = (
                        http::HeaderName::try_from(name.as_str()),
                        http::HeaderValue::from_str(value),
                    ) {
                        out.headers_mut().insert(n, v);
                    }
                }
                Ok(out)
            }
            Ok(Flow::Continue) => {
                let page = render_error(
                    &EdgeError::not_found(),
                    &err_cx,
                    accept.as_deref(),
                    &self.templates,
                );
                Ok(plain_response(page, &ray))
            }
            Ok(Flow::Drop) => Err(AbortConnection),
            Err(edge) => {
                let page = render_error(&edge, &err_cx, accept.as_deref(), &self.templates);
                Ok(plain_response(page, &ray))
            }
        }
    }

    /// Dispatch with portal restarts. A portal handler sets `portal_to`;
    /// the restart happens here, once.
    async fn dispatch(&self, cx: &mut Exchange, is_rpc: bool) -> Result<Flow, EdgeError> {
        loop {
            let flow = if is_rpc {
                match self.rpc.load_full() {
                    Some(handler) => handler.serve(cx).await?,
                    None => Flow::Continue,
                }
            } else {
                self.router.dispatch(cx).await?
            };

            if let Some(to) = cx.portal_to.take() {
                cx.portal_hops += 1;
                if let Some(host) = to.host() {
                    if let Ok(v) = http::HeaderValue::from_str(host) {
                        cx.headers.insert(http::header::HOST, v);
                    }
                }
                let pq = to.path_and_query().map(|pq| pq.as_str()).unwrap_or("/").to_string();
                cx.set_path_and_query(&pq)?;
                cx.response = None;
                continue;
            }

            return Ok(flow);
        }
    }
}

fn plain_response(response: Response, ray: &pm3_core::RayId) -> http::Response<Full<Bytes>> {
    let status =
        http::StatusCode::from_u16(response.status).unwrap_or(http::StatusCode::BAD_GATEWAY);
    let mut builder = http::Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        *headers = response.headers;
        if let Ok(v) = http::HeaderValue::from_str(ray.as_str()) {
            headers.insert(RAY_HEADER, v);
        }
    }
    // Infallible with a prebuilt status and header map.
    builder
        .body(Full::new(response.body))
        .unwrap_or_else(|_| http::Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
