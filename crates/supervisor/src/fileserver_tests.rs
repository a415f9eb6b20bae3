// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use pm3_manifest::FileServerSpec;
use pm3_proxy::{Exchange, IpInfoStack, Scheme, SessionTable};
use pm3_core::{new_ray_id, FakeClock};
use std::sync::Arc;

fn spec(root: &Path) -> FileServerSpec {
    FileServerSpec { root: root.to_path_buf(), ..FileServerSpec::default() }
}

fn write(root: &Path, rel: &str, body: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, body).unwrap();
}

fn exchange(path: &str) -> Exchange {
    let clock = FakeClock::new();
    let table = SessionTable::new(clock, Arc::new(IpInfoStack::builtin()));
    let session = table.start_request("203.0.113.7".parse().unwrap(), &http::HeaderMap::new());
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::HOST, "cdn.example.com".parse().unwrap());
    Exchange::new(
        http::Method::GET,
        path.parse().unwrap(),
        headers,
        bytes::Bytes::new(),
        Scheme::Https,
        session,
        new_ray_id(),
    )
}

#[tokio::test]
async fn serves_files_with_content_type() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "app.js", b"console.log(1)");
    let server = FileServer::load(&spec(dir.path())).unwrap();

    let mut cx = exchange("/app.js");
    assert_eq!(server.serve(&mut cx).await.unwrap(), Flow::Done);
    let resp = cx.response.unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(
        resp.headers.get(http::header::CONTENT_TYPE).unwrap(),
        "text/javascript; charset=utf-8"
    );
    assert_eq!(resp.body, bytes::Bytes::from("console.log(1)"));
}

#[tokio::test]
async fn directories_serve_the_index() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "docs/index.html", b"<h1>docs</h1>");
    let server = FileServer::load(&spec(dir.path())).unwrap();

    for path in ["/docs", "/docs/"] {
        let mut cx = exchange(path);
        server.serve(&mut cx).await.unwrap();
        assert_eq!(cx.response.unwrap().body, bytes::Bytes::from("<h1>docs</h1>"), "{path}");
    }
}

#[tokio::test]
async fn miss_continues_without_not_found_file() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "index.html", b"home");
    let server = FileServer::load(&spec(dir.path())).unwrap();

    let mut cx = exchange("/missing.png");
    assert_eq!(server.serve(&mut cx).await.unwrap(), Flow::Continue);
}

#[tokio::test]
async fn miss_routes_through_not_found_file() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "404.html", b"lost");
    let mut s = spec(dir.path());
    s.not_found = Some("/404.html".into());
    let server = FileServer::load(&s).unwrap();

    let mut cx = exchange("/missing");
    assert_eq!(server.serve(&mut cx).await.unwrap(), Flow::Done);
    let resp = cx.response.unwrap();
    assert_eq!(resp.status, 404);
    assert_eq!(resp.body, bytes::Bytes::from("lost"));
}

#[tokio::test]
async fn compressible_text_gets_brotli_when_accepted() {
    let dir = tempfile::tempdir().unwrap();
    // Highly repetitive: compresses far below 90%.
    let body = "abcdefgh ".repeat(4096);
    write(dir.path(), "big.txt", body.as_bytes());
    let server = FileServer::load(&spec(dir.path())).unwrap();

    let mut cx = exchange("/big.txt");
    cx.headers.insert(http::header::ACCEPT_ENCODING, "gzip, br".parse().unwrap());
    server.serve(&mut cx).await.unwrap();
    let resp = cx.response.unwrap();
    assert_eq!(resp.headers.get(http::header::CONTENT_ENCODING).unwrap(), "br");
    assert!(resp.body.len() < body.len());

    // Without the accept header the identity body is served.
    let mut cx = exchange("/big.txt");
    server.serve(&mut cx).await.unwrap();
    let resp = cx.response.unwrap();
    assert!(resp.headers.get(http::header::CONTENT_ENCODING).is_none());
    assert_eq!(resp.body.len(), body.len());
}

#[tokio::test]
async fn precompressed_formats_are_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "photo.jpg", &[0u8; 8192]);
    let server = FileServer::load(&spec(dir.path())).unwrap();

    let mut cx = exchange("/photo.jpg");
    cx.headers.insert(http::header::ACCEPT_ENCODING, "br".parse().unwrap());
    server.serve(&mut cx).await.unwrap();
    let resp = cx.response.unwrap();
    assert!(resp.headers.get(http::header::CONTENT_ENCODING).is_none());
}

#[tokio::test]
async fn immutable_prefix_gets_year_cache() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "immutable/app.abc123.js", b"x");
    write(dir.path(), "plain.js", b"y");
    let mut s = spec(dir.path());
    s.immutable = true;
    let server = FileServer::load(&s).unwrap();

    let mut cx = exchange("/immutable/app.abc123.js");
    server.serve(&mut cx).await.unwrap();
    assert!(cx
        .response
        .unwrap()
        .headers
        .get(http::header::CACHE_CONTROL)
        .is_some());

    let mut cx = exchange("/plain.js");
    server.serve(&mut cx).await.unwrap();
    assert!(cx
        .response
        .unwrap()
        .headers
        .get(http::header::CACHE_CONTROL)
        .is_none());
}

#[tokio::test]
async fn filter_limits_loaded_files() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "keep.html", b"k");
    write(dir.path(), "skip.tmp", b"s");
    let mut s = spec(dir.path());
    s.filter = Some(r"\.html$".into());
    let server = FileServer::load(&s).unwrap();

    assert_eq!(server.len(), 1);
    let mut cx = exchange("/skip.tmp");
    assert_eq!(server.serve(&mut cx).await.unwrap(), Flow::Continue);
}

#[tokio::test]
async fn path_traversal_is_contained() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "index.html", b"home");
    let server = FileServer::load(&spec(dir.path())).unwrap();

    let mut cx = exchange("/../index.html");
    assert_eq!(server.serve(&mut cx).await.unwrap(), Flow::Done);
    assert_eq!(cx.response.unwrap().body, bytes::Bytes::from("home"));
}
