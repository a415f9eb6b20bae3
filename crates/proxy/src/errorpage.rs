// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error rendering.
//!
//! Content type follows the client's `Accept` header (HTML, JSON, plain).
//! Every page carries the code, title, explanation, solution, serving
//! host, ray id, and client ip. Custom templates keyed by code may be
//! installed at reload; `{field}` placeholders are substituted.

use crate::handler::Response;
use arc_swap::ArcSwap;
use pm3_core::{EdgeError, RayId};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Installed custom templates, swapped atomically on reload.
#[derive(Default)]
pub struct ErrorTemplates {
    by_code: ArcSwap<HashMap<u16, String>>,
}

impl ErrorTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, templates: HashMap<u16, String>) {
        self.by_code.store(Arc::new(templates));
    }

    fn custom(&self, code: u16) -> Option<String> {
        self.by_code.load().get(&code).cloned()
    }
}

/// What the client wants to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Html,
    Json,
    Plain,
}

fn negotiate(accept: Option<&str>) -> Format {
    let Some(accept) = accept else { return Format::Plain };
    // First acceptable wins; browsers lead with text/html.
    for part in accept.split(',') {
        let mime = part.split(';').next().unwrap_or("").trim();
        match mime {
            "text/html" | "application/xhtml+xml" => return Format::Html,
            "application/json" => return Format::Json,
            "text/plain" => return Format::Plain,
            _ => {}
        }
    }
    Format::Plain
}

/// Context rendered into every error page.
pub struct ErrorContext<'a> {
    pub host: &'a str,
    pub ray: &'a RayId,
    pub client_ip: IpAddr,
}

/// Render an edge error into a buffered response.
///
/// 2xx collapses to bare headers; codes the HTTP status line cannot carry
/// ride in `P-Status` over a 502.
pub fn render_error(
    err: &EdgeError,
    cx: &ErrorContext<'_>,
    accept: Option<&str>,
    templates: &ErrorTemplates,
) -> Response {
    if (200..300).contains(&err.code) {
        return Response::new(err.code);
    }

    let wire_status = if err.is_wire_status() { err.code } else { 502 };
    let format = negotiate(accept);

    let body = match templates.custom(err.code) {
        Some(template) => substitute(&template, err, cx),
        None => match format {
            Format::Html => html_body(err, cx),
            Format::Json => json_body(err, cx),
            Format::Plain => plain_body(err, cx),
        },
    };

    let content_type = match format {
        Format::Html => "text/html; charset=utf-8",
        Format::Json => "application/json",
        Format::Plain => "text/plain; charset=utf-8",
    };

    let mut resp = Response::with_body(wire_status, content_type, body);
    if !err.is_wire_status() {
        if let Ok(v) = http::HeaderValue::from_str(&err.code.to_string()) {
            resp.headers.insert("p-status", v);
        }
    }
    if let Ok(v) = http::HeaderValue::from_str(cx.ray.as_str()) {
        resp.headers.insert(crate::RAY_HEADER, v);
    }
    resp
}

fn substitute(template: &str, err: &EdgeError, cx: &ErrorContext<'_>) -> String {
    template
        .replace("{code}", &err.code.to_string())
        .replace("{title}", &err.title)
        .replace("{explanation}", &err.explanation)
        .replace("{solution}", &err.solution)
        .replace("{host}", cx.host)
        .replace("{ray}", cx.ray.as_str())
        .replace("{ip}", &cx.client_ip.to_string())
}

fn plain_body(err: &EdgeError, cx: &ErrorContext<'_>) -> String {
    format!(
        "{} {}\n{}\n{}\nhost: {}\nray: {}\nclient: {}\n",
        err.code, err.title, err.explanation, err.solution, cx.host, cx.ray, cx.client_ip
    )
}

fn json_body(err: &EdgeError, cx: &ErrorContext<'_>) -> String {
    serde_json::json!({
        "code": err.code,
        "title": err.title,
        "explanation": err.explanation,
        "solution": err.solution,
        "host": cx.host,
        "ray": cx.ray.as_str(),
        "client": cx.client_ip.to_string(),
    })
    .to_string()
}

fn html_body(err: &EdgeError, cx: &ErrorContext<'_>) -> String {
    format!(
        "<!doctype html><html><head><title>{code} {title}</title></head>\
         <body><h1>{code} {title}</h1><p>{explanation}</p><p>{solution}</p>\
         <hr><small>{host} &middot; ray {ray} &middot; {ip}</small></body></html>",
        code = err.code,
        title = escape(&err.title),
        explanation = escape(&err.explanation),
        solution = escape(&err.solution),
        host = escape(cx.host),
        ray = cx.ray,
        ip = cx.client_ip,
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
#[path = "errorpage_tests.rs"]
mod tests;
