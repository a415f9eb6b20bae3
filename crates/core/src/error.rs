// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Edge error model.
//!
//! Every error surfaced to a client carries a numeric code, a short title,
//! an explanation, and a suggested fix. Codes above 1000 are pm3-specific
//! and ride in the status line the same way HTTP codes do.

use serde::{Deserialize, Serialize};

/// Classifies an [`EdgeError`] for propagation policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Transient upstream failure; retry per policy.
    TransientUpstream,
    /// 4xx from the upstream; never retried, never logged as a server fault.
    PermanentUpstream,
    /// Upstream asked for the connection to be reset (status 444).
    UpstreamReset,
    /// Client exceeded a rate limit.
    RateExceeded,
    /// Authentication failed (401 challenge).
    AuthFailure,
    /// Signed-URL verification failed.
    SignatureMismatch,
    /// A second portal restart in one request.
    PortalLoop,
    /// Handler panicked with an untouched response.
    Panic,
    /// Broker publish/consume unavailable.
    BrokerUnavailable,
    /// Anything else rendered as a 5xx.
    Internal,
}

/// pm3-specific status codes (shared with clients, stable).
pub mod code {
    pub const BLOCKED: u16 = 1021;
    pub const PORTAL_LOOP: u16 = 1023;
    pub const PANIC: u16 = 1024;
    pub const BAD_SIGNATURE: u16 = 1025;
    pub const BROKER_UNAVAILABLE: u16 = 1026;
}

/// A renderable edge error. The proxy turns these into HTML/JSON/plain
/// bodies depending on the client's `Accept` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeError {
    pub code: u16,
    pub kind: ErrorKind,
    pub title: String,
    pub explanation: String,
    pub solution: String,
}

impl EdgeError {
    pub fn new(code: u16, kind: ErrorKind, title: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            title: title.into(),
            explanation: String::new(),
            solution: String::new(),
        }
    }

    pub fn explain(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }

    pub fn solve(mut self, solution: impl Into<String>) -> Self {
        self.solution = solution.into();
        self
    }

    pub fn blocked() -> Self {
        Self::new(code::BLOCKED, ErrorKind::RateExceeded, "Blocked")
            .explain("Your address has been temporarily blocked.")
            .solve("Wait for the block to expire before retrying.")
    }

    pub fn rate_limited() -> Self {
        Self::new(429, ErrorKind::RateExceeded, "Too Many Requests")
            .explain("You sent more requests than this endpoint allows.")
            .solve("Honor the Retry-After header.")
    }

    pub fn portal_loop() -> Self {
        Self::new(code::PORTAL_LOOP, ErrorKind::PortalLoop, "Restart Loop")
            .explain("The request was re-dispatched more than once by portal handlers.")
            .solve("Break the portal cycle in the handler chain.")
    }

    pub fn panic() -> Self {
        Self::new(code::PANIC, ErrorKind::Panic, "Internal Error")
            .explain("The server hit an unexpected condition while handling the request.")
            .solve("Retry; if it persists, check the server logs for this ray.")
    }

    pub fn bad_signature() -> Self {
        Self::new(code::BAD_SIGNATURE, ErrorKind::SignatureMismatch, "Invalid Signature")
            .explain("The request's signature parameters did not verify.")
            .solve("Request a freshly signed URL.")
    }

    pub fn broker_unavailable() -> Self {
        Self::new(code::BROKER_UNAVAILABLE, ErrorKind::BrokerUnavailable, "Broker Unavailable")
            .explain("The message broker did not accept the publish.")
            .solve("Retry once the node's broker connection recovers.")
    }

    pub fn upstream_unavailable() -> Self {
        Self::new(502, ErrorKind::TransientUpstream, "Upstream Error")
            .explain("No upstream produced a usable response.")
            .solve("Retry; the service may be restarting.")
    }

    pub fn not_found() -> Self {
        Self::new(404, ErrorKind::PermanentUpstream, "Not Found")
            .explain("Nothing is mounted at this host and path.")
            .solve("Check the address.")
    }

    pub fn unauthorized() -> Self {
        Self::new(401, ErrorKind::AuthFailure, "Unauthorized")
            .explain("This endpoint requires credentials.")
            .solve("Authenticate and retry.")
    }

    /// Whether the HTTP status line can carry this code as-is.
    pub fn is_wire_status(&self) -> bool {
        (100..1000).contains(&self.code)
    }
}

impl std::fmt::Display for EdgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.title)
    }
}

impl std::error::Error for EdgeError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
