// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Virtual-host reverse proxy.
//!
//! Inbound requests flow: server entry -> vhost router -> handler pipeline
//! -> load balancer -> upstream. Every stage speaks the tri-state
//! [`Flow`] contract; the message runner reuses the same pipeline for
//! broker-delivered work.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

#[cfg(test)]
pub(crate) mod test_support;

mod balancer;
mod directive;
mod errorpage;
mod handler;
mod ipinfo;
mod limiter;
mod pattern;
mod registry;
mod server;
mod session;
mod signed;
mod tls;
mod upstream;
mod vhost;

pub use balancer::{LoadBalancer, RetryPolicy, StatusPolicy, Strategy};
pub use directive::{clean_path, parse_directive};
pub use errorpage::{render_error, ErrorContext, ErrorTemplates};
pub use handler::{Exchange, Flow, Handler, Pipeline, ProxyError, Response, Scheme, ServiceDirectory};
pub use ipinfo::{BuiltinProvider, IpInfo, IpInfoProvider, IpInfoStack, MarkerProvider, RefreshCache};
pub use limiter::{enforce, LimitOutcome};
pub use pattern::Pattern;
pub use registry::{build_handler, build_pipeline, RegistryEnv};
pub use server::{AbortConnection, ProxyServer, ServerConfig};
pub use session::{ClientSession, SessionTable};
pub use signed::{sign_url, verify_signed, SignedVerdict};
pub use tls::{CertStore, FileCert};
pub use upstream::{RequestGuard, Upstream};
pub use vhost::{Vhost, VhostGroup, VhostRouter};

/// Reserved hostname serving the node RPC surface.
pub const RPC_HOST: &str = "pm3";
/// Header injected once a request is proven internal (signed URL or peer).
pub const INTERNAL_HEADER: &str = "p-internal";
/// Response header carrying the ray id.
pub const RAY_HEADER: &str = "p-ray";
