// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::io::Write;

#[yare::parameterized(
    cf_core = { "104.16.0.1", true },
    cf_172 = { "172.64.1.1", true },
    not_cf = { "203.0.113.7", false },
    loopback = { "127.0.0.1", false },
)]
fn cloudflare_detection(ip: &str, want: bool) {
    let stack = IpInfoStack::builtin();
    assert_eq!(stack.is_cloudflare(&ip.parse().unwrap()), want);
}

#[test]
fn marker_provider_flags_listed_ranges() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# bad actors").unwrap();
    writeln!(file, "198.51.100.0/24").unwrap();
    file.flush().unwrap();

    let provider = MarkerProvider::new(file.path().to_path_buf());
    assert!(provider.lookup(&"198.51.100.20".parse().unwrap()).unwrap().marked);
    assert!(provider.lookup(&"203.0.113.1".parse().unwrap()).is_none());
}

#[test]
fn stack_merges_providers() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "104.16.0.0/16").unwrap();
    file.flush().unwrap();

    let stack = IpInfoStack::new(vec![
        Arc::new(BuiltinProvider),
        Arc::new(MarkerProvider::new(file.path().to_path_buf())),
    ]);
    let info = stack.lookup(&"104.16.0.9".parse().unwrap());
    assert!(info.cloudflare);
    assert!(info.marked);
}

#[test]
fn headers_reflect_flags() {
    let stack = IpInfoStack::builtin();
    let headers = stack.headers_for(&"104.16.0.1".parse().unwrap());
    assert!(headers.iter().any(|(k, v)| k == "p-cf" && v == "1"));
    assert!(stack.headers_for(&"203.0.113.1".parse().unwrap()).is_empty());
}

#[test]
fn refresh_cache_serves_stale_then_refreshes() {
    use std::sync::atomic::{AtomicU32, Ordering};
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let cache = RefreshCache::new(0u32, move || {
        Some(counter.fetch_add(1, Ordering::Relaxed) + 1)
    });

    // Inside the window nothing refetches.
    let first = cache.get(REFRESH_WINDOW.as_millis() as u64 - 1);
    let window = REFRESH_WINDOW.as_millis() as u64;
    let second = cache.get(window + 1);
    assert!(*second >= *first);
    let calls_after = calls.load(Ordering::Relaxed);
    assert!(calls_after >= 1);

    // Repeated reads inside the new window do not refetch again.
    cache.get(window + 2);
    cache.get(window + 3);
    assert_eq!(calls.load(Ordering::Relaxed), calls_after);
}
