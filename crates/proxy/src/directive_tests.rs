// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::handler::Flow;
use crate::test_support::{exchange, public_session, table};
use base64::Engine as _;

#[yare::parameterized(
    plain = { "/a/b/c", "/a/b/c" },
    dot = { "/a/./b", "/a/b" },
    dotdot = { "/a/x/../b", "/a/b" },
    escape_attempt = { "/../../etc/passwd", "/etc/passwd" },
    double_slash = { "/a//b", "/a/b" },
    trailing = { "/a/b/", "/a/b/" },
    root = { "/", "/" },
)]
fn clean_path_cases(input: &str, want: &str) {
    assert_eq!(clean_path(input), want);
}

#[tokio::test]
async fn drop_directive_drops() {
    let (table, _) = table();
    let handler = parse_directive("drop").unwrap();
    let mut cx = exchange("example.com", "/", public_session(&table));
    assert_eq!(handler.serve(&mut cx).await.unwrap(), Flow::Drop);
    assert!(!cx.abort);
}

#[tokio::test]
async fn abort_directive_resets() {
    let (table, _) = table();
    let handler = parse_directive("abort").unwrap();
    let mut cx = exchange("example.com", "/", public_session(&table));
    assert_eq!(handler.serve(&mut cx).await.unwrap(), Flow::Drop);
    assert!(cx.abort);
}

#[tokio::test]
async fn status_directive_responds() {
    let (table, _) = table();
    let handler = parse_directive("status 418").unwrap();
    let mut cx = exchange("example.com", "/", public_session(&table));
    assert_eq!(handler.serve(&mut cx).await.unwrap(), Flow::Done);
    assert_eq!(cx.response.unwrap().status, 418);
}

#[tokio::test]
async fn redirect_directive_sets_location() {
    let (table, _) = table();
    let handler = parse_directive("redirect https://example.com/new permanent").unwrap();
    let mut cx = exchange("example.com", "/old", public_session(&table));
    handler.serve(&mut cx).await.unwrap();
    let resp = cx.response.unwrap();
    assert_eq!(resp.status, 301);
    assert_eq!(
        resp.headers.get(http::header::LOCATION).unwrap(),
        "https://example.com/new"
    );
}

#[tokio::test]
async fn path_join_resolves_relative_segments() {
    let (table, _) = table();
    let handler = parse_directive("path-join ../static").unwrap();
    let mut cx = exchange("example.com", "/app/page", public_session(&table));
    assert_eq!(handler.serve(&mut cx).await.unwrap(), Flow::Continue);
    assert_eq!(cx.path(), "/app/static");
}

#[tokio::test]
async fn portal_sets_target_once() {
    let (table, _) = table();
    let handler = parse_directive("portal http://inner.example.com/x").unwrap();
    let mut cx = exchange("example.com", "/", public_session(&table));

    assert_eq!(handler.serve(&mut cx).await.unwrap(), Flow::Done);
    assert!(cx.portal_to.is_some());

    // Second portal in the same request is a restart loop.
    cx.portal_hops = 1;
    let err = handler.serve(&mut cx).await.unwrap_err();
    assert_eq!(err.code, 1023);
}

#[tokio::test]
async fn auth_challenges_then_clears_header() {
    let (table, _) = table();
    let handler = parse_directive("auth ops admin:hunter2").unwrap();

    // No credentials: 401 with the realm.
    let mut cx = exchange("example.com", "/", public_session(&table));
    assert_eq!(handler.serve(&mut cx).await.unwrap(), Flow::Done);
    let resp = cx.response.take().unwrap();
    assert_eq!(resp.status, 401);
    assert_eq!(
        resp.headers.get(http::header::WWW_AUTHENTICATE).unwrap(),
        "Basic realm=\"ops\""
    );

    // Good credentials: pass, and the header is removed before forwarding.
    let mut cx = exchange("example.com", "/", public_session(&table));
    let b64 = base64::engine::general_purpose::STANDARD.encode("admin:hunter2");
    cx.headers.insert(
        http::header::AUTHORIZATION,
        format!("Basic {b64}").parse().unwrap(),
    );
    assert_eq!(handler.serve(&mut cx).await.unwrap(), Flow::Continue);
    assert!(cx.headers.get(http::header::AUTHORIZATION).is_none());
}

#[tokio::test]
async fn strip_prefix_rewrites_path() {
    let (table, _) = table();
    let handler = parse_directive("strip-prefix /api").unwrap();
    let mut cx = exchange("example.com", "/api/v1/users", public_session(&table));
    handler.serve(&mut cx).await.unwrap();
    assert_eq!(cx.path(), "/v1/users");
}

#[test]
fn unknown_verb_is_no_match() {
    assert!(matches!(parse_directive("zorp 1 2"), Err(ProxyError::NoMatch)));
}

#[yare::parameterized(
    missing_arg = { "status" },
    bad_int = { "status many" },
    trailing = { "drop now" },
    bad_cred = { "auth realm nopassword" },
)]
fn malformed_directives_error(input: &str) {
    assert!(matches!(
        parse_directive(input),
        Err(ProxyError::BadDirective(_, _))
    ));
}

#[test]
fn quoted_arguments_group() {
    let mut args = Args::new("header x-note \"hello world\"");
    assert_eq!(args.next_str("verb").unwrap(), "header");
    assert_eq!(args.next_str("name").unwrap(), "x-note");
    assert_eq!(args.next_str("value").unwrap(), "hello world");
    assert!(args.finish().is_ok());
}

#[test]
fn typed_parsers() {
    let mut args = Args::new("x 30s 42 permanent");
    args.next_str("verb").unwrap();
    assert_eq!(args.next_duration("d").unwrap(), std::time::Duration::from_secs(30));
    assert_eq!(args.next_int::<u16>("n").unwrap(), 42);
    assert_eq!(args.next_enum("kind", &["permanent", "temporary"]).unwrap(), "permanent");
}
