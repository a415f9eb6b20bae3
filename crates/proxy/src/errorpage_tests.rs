// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use pm3_core::new_ray_id;

fn cx(ray: &RayId) -> ErrorContext<'_> {
    ErrorContext { host: "node-1", ray, client_ip: "203.0.113.5".parse().unwrap() }
}

#[test]
fn html_for_browsers() {
    let ray = new_ray_id();
    let resp = render_error(
        &EdgeError::not_found(),
        &cx(&ray),
        Some("text/html,application/xhtml+xml"),
        &ErrorTemplates::new(),
    );
    assert_eq!(resp.status, 404);
    let body = String::from_utf8(resp.body.to_vec()).unwrap();
    assert!(body.contains("<h1>404 Not Found</h1>"), "{body}");
    assert!(body.contains(ray.as_str()));
}

#[test]
fn json_for_apis() {
    let ray = new_ray_id();
    let resp = render_error(
        &EdgeError::rate_limited(),
        &cx(&ray),
        Some("application/json"),
        &ErrorTemplates::new(),
    );
    let parsed: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(parsed["code"], 429);
    assert_eq!(parsed["ray"], ray.as_str());
    assert_eq!(parsed["client"], "203.0.113.5");
}

#[test]
fn plain_is_the_fallback() {
    let ray = new_ray_id();
    let resp = render_error(&EdgeError::not_found(), &cx(&ray), None, &ErrorTemplates::new());
    let body = String::from_utf8(resp.body.to_vec()).unwrap();
    assert!(body.starts_with("404 Not Found"));
}

#[test]
fn out_of_band_codes_ride_a_header() {
    let ray = new_ray_id();
    let resp = render_error(&EdgeError::blocked(), &cx(&ray), None, &ErrorTemplates::new());
    // 1021 cannot ride the status line.
    assert_eq!(resp.status, 502);
    assert_eq!(resp.headers.get("p-status").unwrap(), "1021");
    let body = String::from_utf8(resp.body.to_vec()).unwrap();
    assert!(body.contains("1021"));
}

#[test]
fn two_xx_collapse_to_bare_headers() {
    let ray = new_ray_id();
    let ok = EdgeError::new(204, pm3_core::ErrorKind::Internal, "No Content");
    let resp = render_error(&ok, &cx(&ray), Some("text/html"), &ErrorTemplates::new());
    assert_eq!(resp.status, 204);
    assert!(resp.body.is_empty());
}

#[test]
fn custom_templates_override() {
    let ray = new_ray_id();
    let templates = ErrorTemplates::new();
    templates.install(
        [(404u16, "lost: {code} via {host} ray={ray}".to_string())]
            .into_iter()
            .collect(),
    );
    let resp = render_error(&EdgeError::not_found(), &cx(&ray), None, &templates);
    let body = String::from_utf8(resp.body.to_vec()).unwrap();
    assert_eq!(body, format!("lost: 404 via node-1 ray={ray}"));
}
