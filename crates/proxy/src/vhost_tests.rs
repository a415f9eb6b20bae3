// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::handler::{Handler, Response, Scheme};
use crate::test_support::{exchange, public_session, table};
use async_trait::async_trait;

struct Fixed(u16);

#[async_trait]
impl Handler for Fixed {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, pm3_core::EdgeError> {
        Ok(cx.respond(Response::new(self.0)))
    }

    fn describe(&self) -> String {
        format!("fixed {}", self.0)
    }
}

struct PassThrough;

#[async_trait]
impl Handler for PassThrough {
    async fn serve(&self, _cx: &mut Exchange) -> Result<Flow, pm3_core::EdgeError> {
        Ok(Flow::Continue)
    }

    fn describe(&self) -> String {
        "pass".into()
    }
}

fn vhost(names: &[&str], status: u16) -> Arc<Vhost> {
    Arc::new(Vhost {
        hostnames: names.iter().map(|s| s.to_string()).collect(),
        pipeline: Pipeline::new(vec![Arc::new(Fixed(status))]),
        no_upgrade: false,
        cert_key: None,
    })
}

#[yare::parameterized(
    exact = { "example.com", "example.com", true },
    sub = { "*.example.com", "api.example.com", true },
    bare_root_on_wildcard = { "*.example.com", "example.com", true },
    deep_sub = { "*.example.com", "a.b.example.com", true },
    other = { "example.com", "other.com", false },
    not_suffix = { "*.example.com", "badexample.com", false },
)]
fn host_pattern_matching(pattern: &str, host: &str, want: bool) {
    assert_eq!(host_matches(pattern, host), want);
}

#[yare::parameterized(
    bare = { "example.com", "example.com" },
    sub = { "api.example.com", "example.com" },
    deep = { "a.b.example.com", "example.com" },
    wildcard = { "*.example.com", "example.com" },
)]
fn root_domain_grouping(host: &str, want: &str) {
    assert_eq!(root_domain(host), want);
}

#[tokio::test]
async fn groups_fall_through_in_declaration_order() {
    let router = VhostRouter::new();
    router.install(vec![
        Arc::new(Vhost {
            hostnames: vec!["api.example.com".into()],
            pipeline: Pipeline::new(vec![Arc::new(PassThrough)]),
            no_upgrade: false,
            cert_key: None,
        }),
        vhost(&["*.example.com"], 201),
    ]);

    // First member continues; fallthrough reaches the wildcard member.
    let (table, _) = table();
    let mut cx = exchange("api.example.com", "/", public_session(&table));
    let flow = router.dispatch(&mut cx).await.unwrap();
    assert_eq!(flow, Flow::Done);
    assert_eq!(cx.response.unwrap().status, 201);
}

#[tokio::test]
async fn done_stops_fallthrough() {
    let router = VhostRouter::new();
    router.install(vec![vhost(&["*.example.com"], 200), vhost(&["*.example.com"], 500)]);

    let (table, _) = table();
    let mut cx = exchange("x.example.com", "/", public_session(&table));
    router.dispatch(&mut cx).await.unwrap();
    assert_eq!(cx.response.unwrap().status, 200);
}

#[tokio::test]
async fn unknown_host_is_not_served() {
    let router = VhostRouter::new();
    router.install(vec![vhost(&["example.com"], 200)]);

    assert!(router.knows_host("example.com"));
    assert!(!router.knows_host("ghost.net"));

    let (table, _) = table();
    let mut cx = exchange("ghost.net", "/", public_session(&table));
    let flow = router.dispatch(&mut cx).await.unwrap();
    assert_eq!(flow, Flow::Continue);
    assert!(cx.response.is_none());
}

#[tokio::test]
async fn upgrade_redirects_insecure_requests() {
    let router = VhostRouter::new();
    router.install(vec![vhost(&["example.com"], 200)]);

    let (table, _) = table();
    let mut cx = exchange("example.com", "/page?q=1", public_session(&table));
    cx.scheme = Scheme::Http;
    cx.headers.insert("upgrade-insecure-requests", "1".parse().unwrap());

    router.dispatch(&mut cx).await.unwrap();
    let resp = cx.response.unwrap();
    assert_eq!(resp.status, 301);
    assert_eq!(
        resp.headers.get(http::header::LOCATION).unwrap(),
        "https://example.com/page?q=1"
    );
}

#[tokio::test]
async fn upgrade_respects_opt_out_and_https() {
    let router = VhostRouter::new();
    router.install(vec![Arc::new(Vhost {
        hostnames: vec!["example.com".into()],
        pipeline: Pipeline::new(vec![Arc::new(Fixed(200))]),
        no_upgrade: true,
        cert_key: None,
    })]);

    let (table, _) = table();
    let mut cx = exchange("example.com", "/", public_session(&table));
    cx.scheme = Scheme::Http;
    cx.headers.insert("upgrade-insecure-requests", "1".parse().unwrap());
    router.dispatch(&mut cx).await.unwrap();
    assert_eq!(cx.response.unwrap().status, 200, "opted-out vhost serves http");

    let (table, _) = crate::test_support::table();
    let router2 = VhostRouter::new();
    router2.install(vec![vhost(&["example.com"], 200)]);
    let mut cx = exchange("example.com", "/", public_session(&table));
    cx.headers.insert("upgrade-insecure-requests", "1".parse().unwrap());
    router2.dispatch(&mut cx).await.unwrap();
    assert_eq!(cx.response.unwrap().status, 200, "https requests are not redirected");
}

#[test]
fn sni_lookup_prefers_exact_host() {
    let router = VhostRouter::new();
    let wild = vhost(&["*.example.com"], 200);
    let exact = Arc::new(Vhost {
        hostnames: vec!["api.example.com".into()],
        pipeline: Pipeline::new(vec![Arc::new(Fixed(200))]),
        no_upgrade: false,
        cert_key: Some("api-cert".into()),
    });
    router.install(vec![wild, exact]);

    let hit = router.vhost_for_sni("api.example.com").unwrap();
    assert_eq!(hit.cert_key.as_deref(), Some("api-cert"));
    assert!(router.vhost_for_sni("ghost.net").is_none());
}
