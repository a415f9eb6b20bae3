// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inline directive handlers.
//!
//! A directive is a scalar handler node of the form `verb arg1 arg2...`.
//! All of them are parsed by one routine: whitespace-collapsed
//! tokenization (double quotes group), then typed argument parsers.

use crate::handler::{Exchange, Flow, Handler, Response};
use crate::ProxyError;
use async_trait::async_trait;
use base64::Engine;
use pm3_core::EdgeError;
use std::sync::Arc;
use std::time::Duration;

/// Token cursor over a directive line.
pub struct Args {
    raw: String,
    tokens: Vec<String>,
    pos: usize,
}

impl Args {
    fn tokenize(raw: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut quoted = false;
        for ch in raw.chars() {
            match ch {
                '"' => quoted = !quoted,
                c if c.is_whitespace() && !quoted => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            }
        }
        if !current.is_empty() {
            tokens.push(current);
        }
        tokens
    }

    pub fn new(raw: &str) -> Self {
        Self { raw: raw.to_string(), tokens: Self::tokenize(raw), pos: 0 }
    }

    fn err(&self, reason: impl Into<String>) -> ProxyError {
        ProxyError::BadDirective(self.raw.clone(), reason.into())
    }

    pub fn next_str(&mut self, what: &str) -> Result<String, ProxyError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.err(format!("missing {what}")))?;
        self.pos += 1;
        Ok(token)
    }

    pub fn maybe_str(&mut self) -> Option<String> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    pub fn next_int<T: std::str::FromStr>(&mut self, what: &str) -> Result<T, ProxyError> {
        let token = self.next_str(what)?;
        token.parse().map_err(|_| self.err(format!("bad {what} {token:?}")))
    }

    pub fn next_duration(&mut self, what: &str) -> Result<Duration, ProxyError> {
        let token = self.next_str(what)?;
        humantime::parse_duration(&token).map_err(|e| self.err(format!("bad {what}: {e}")))
    }

    pub fn next_enum(&mut self, what: &str, choices: &[&str]) -> Result<String, ProxyError> {
        let token = self.next_str(what)?;
        if choices.contains(&token.as_str()) {
            Ok(token)
        } else {
            Err(self.err(format!("{what} must be one of {choices:?}, got {token:?}")))
        }
    }

    pub fn maybe_enum(&mut self, choices: &[&str]) -> Option<String> {
        let token = self.tokens.get(self.pos)?;
        if choices.contains(&token.as_str()) {
            self.pos += 1;
            Some(token.clone())
        } else {
            None
        }
    }

    pub fn finish(&self) -> Result<(), ProxyError> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(self.err(format!("trailing arguments {:?}", &self.tokens[self.pos..])))
        }
    }
}

/// Lexically resolve `.` and `..` segments.
pub fn clean_path(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    let mut cleaned = String::from("/");
    cleaned.push_str(&out.join("/"));
    if path.ends_with('/') && cleaned.len() > 1 {
        cleaned.push('/');
    }
    cleaned
}

enum Verb {
    Drop,
    Abort,
    Status(u16),
    Redirect { to: String, permanent: bool },
    PathJoin(String),
    Portal(String),
    Auth { realm: String, users: Vec<String> },
    Header { name: String, value: String },
    StripPrefix(String),
}

/// A parsed inline directive.
pub struct Directive {
    raw: String,
    verb: Verb,
}

/// Parse one directive line. Returns [`ProxyError::NoMatch`] when the verb
/// is unknown so the registry can fall through to other constructors.
pub fn parse_directive(raw: &str) -> Result<Arc<dyn Handler>, ProxyError> {
    let mut args = Args::new(raw);
    let verb_token = args.next_str("verb").map_err(|_| ProxyError::NoMatch)?;

    let verb = match verb_token.as_str() {
        "drop" => Verb::Drop,
        "abort" => Verb::Abort,
        "status" => Verb::Status(args.next_int("status code")?),
        "redirect" => {
            let to = args.next_str("target url")?;
            let permanent = args
                .maybe_enum(&["permanent", "temporary"])
                .map(|kind| kind == "permanent")
                .unwrap_or(false);
            Verb::Redirect { to, permanent }
        }
        "path-join" => Verb::PathJoin(args.next_str("path")?),
        "portal" => Verb::Portal(args.next_str("target url")?),
        "auth" => {
            let realm = args.next_str("realm")?;
            let mut users = Vec::new();
            while let Some(cred) = args.maybe_str() {
                if !cred.contains(':') {
                    return Err(ProxyError::BadDirective(
                        raw.to_string(),
                        format!("credential {cred:?} must be user:pass"),
                    ));
                }
                users.push(cred);
            }
            if users.is_empty() {
                return Err(ProxyError::BadDirective(raw.into(), "auth needs at least one user:pass".into()));
            }
            Verb::Auth { realm, users }
        }
        "header" => Verb::Header { name: args.next_str("header name")?, value: args.next_str("header value")? },
        "strip-prefix" => Verb::StripPrefix(args.next_str("prefix")?),
        _ => return Err(ProxyError::NoMatch),
    };
    args.finish()?;

    Ok(Arc::new(Directive { raw: raw.to_string(), verb }))
}

#[async_trait]
impl Handler for Directive {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        match &self.verb {
            Verb::Drop => Ok(Flow::Drop),
            Verb::Abort => {
                cx.abort = true;
                Ok(Flow::Drop)
            }
            Verb::Status(code) => Ok(cx.respond(Response::new(*code))),
            Verb::Redirect { to, permanent } => {
                let mut resp = Response::new(if *permanent { 301 } else { 302 });
                if let Ok(v) = http::HeaderValue::from_str(to) {
                    resp.headers.insert(http::header::LOCATION, v);
                }
                Ok(cx.respond(resp))
            }
            Verb::PathJoin(join) => {
                let joined = if join.starts_with('/') {
                    join.clone()
                } else {
                    format!("{}/{}", cx.path(), join)
                };
                let cleaned = clean_path(&joined);
                cx.set_path_and_query(&cleaned)?;
                Ok(Flow::Continue)
            }
            Verb::Portal(to) => {
                if cx.portal_hops >= 1 {
                    return Err(EdgeError::portal_loop());
                }
                let uri: http::Uri = to.parse().map_err(|_| {
                    EdgeError::new(500, pm3_core::ErrorKind::Internal, "Bad Portal")
                        .explain(format!("portal target {to:?} is not a url"))
                })?;
                cx.portal_to = Some(uri);
                Ok(Flow::Done)
            }
            Verb::Auth { realm, users } => {
                let presented = cx
                    .headers
                    .get(http::header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Basic "))
                    .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
                    .and_then(|raw| String::from_utf8(raw).ok());

                match presented {
                    Some(cred) if users.iter().any(|u| u == &cred) => {
                        // Never leak credentials to the upstream.
                        cx.headers.remove(http::header::AUTHORIZATION);
                        Ok(Flow::Continue)
                    }
                    _ => {
                        let mut resp = Response::new(401);
                        if let Ok(v) =
                            http::HeaderValue::from_str(&format!("Basic realm=\"{realm}\""))
                        {
                            resp.headers.insert(http::header::WWW_AUTHENTICATE, v);
                        }
                        Ok(cx.respond(resp))
                    }
                }
            }
            Verb::Header { name, value } => {
                if let (Ok(name), Ok(value)) = (
                    http::HeaderName::try_from(name.as_str()),
                    http::HeaderValue::from_str(value),
                ) {
                    cx.headers.insert(name, value);
                }
                Ok(Flow::Continue)
            }
            Verb::StripPrefix(prefix) => {
                if let Some(rest) = cx.path().strip_prefix(prefix.as_str()) {
                    let rest = if rest.starts_with('/') { rest.to_string() } else { format!("/{rest}") };
                    cx.set_path_and_query(&rest)?;
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn describe(&self) -> String {
        self.raw.clone()
    }
}

#[cfg(test)]
#[path = "directive_tests.rs"]
mod tests;
