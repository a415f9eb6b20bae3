// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::ipinfo::IpInfoStack;
use pm3_core::FakeClock;
use std::net::Ipv4Addr;

fn table() -> (SessionTable<FakeClock>, FakeClock) {
    let clock = FakeClock::new();
    let table = SessionTable::new(clock.clone(), Arc::new(IpInfoStack::builtin()));
    (table, clock)
}

fn headers(pairs: &[(&str, &str)]) -> http::HeaderMap {
    let mut map = http::HeaderMap::new();
    for (k, v) in pairs {
        map.insert(
            http::HeaderName::try_from(*k).unwrap(),
            http::HeaderValue::from_str(v).unwrap(),
        );
    }
    map
}

#[test]
fn public_peer_is_its_own_origin() {
    let (table, _) = table();
    let session = table.start_request(
        "203.0.113.9".parse().unwrap(),
        &headers(&[("x-forwarded-for", "198.51.100.1")]),
    );
    // XFF from an untrusted public peer is ignored.
    assert_eq!(session.ip, "203.0.113.9".parse::<IpAddr>().unwrap());
    assert!(!session.local);
}

#[test]
fn forwarded_for_honored_from_private_peer() {
    let (table, _) = table();
    let session = table.start_request(
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
        &headers(&[("x-forwarded-for", "192.168.1.9, 198.51.100.7, 1.2.3.4")]),
    );
    // First public hop wins; private hops are skipped.
    assert_eq!(session.ip, "198.51.100.7".parse::<IpAddr>().unwrap());
}

#[test]
fn cloudflare_peer_adopts_connecting_ip_and_country() {
    let (table, _) = table();
    // 104.16.0.1 sits in the Cloudflare ranges.
    let session = table.start_request(
        "104.16.0.1".parse().unwrap(),
        &headers(&[("cf-connecting-ip", "198.51.100.20"), ("cf-ipcountry", "NZ")]),
    );
    assert_eq!(session.ip, "198.51.100.20".parse::<IpAddr>().unwrap());
    assert_eq!(session.country.lock().as_deref(), Some("NZ"));
}

#[test]
fn cf_header_ignored_from_non_cloudflare_peer() {
    let (table, _) = table();
    let session = table.start_request(
        "203.0.113.9".parse().unwrap(),
        &headers(&[("cf-connecting-ip", "198.51.100.20")]),
    );
    assert_eq!(session.ip, "203.0.113.9".parse::<IpAddr>().unwrap());
}

#[test]
fn local_origins_share_the_singleton() {
    let (table, _) = table();
    let a = table.start_request("127.0.0.1".parse().unwrap(), &http::HeaderMap::new());
    let b = table.start_request("10.1.2.3".parse().unwrap(), &http::HeaderMap::new());
    assert!(a.local);
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(table.len(), 0, "local sessions are not tabled");
}

#[test]
fn sessions_are_reused_and_counted() {
    let (table, _) = table();
    let ip: IpAddr = "203.0.113.9".parse().unwrap();
    let a = table.start_request(ip, &http::HeaderMap::new());
    let b = table.start_request(ip, &http::HeaderMap::new());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.requests.load(std::sync::atomic::Ordering::Relaxed), 2);
}

#[test]
fn sweep_evicts_idle_sessions_only() {
    let (table, clock) = table();
    let old: IpAddr = "203.0.113.1".parse().unwrap();
    table.start_request(old, &http::HeaderMap::new());

    clock.advance(SESSION_TTL + Duration::from_secs(1));
    let fresh: IpAddr = "203.0.113.2".parse().unwrap();
    table.start_request(fresh, &http::HeaderMap::new());

    let evicted = table.sweep();
    assert_eq!(evicted, 1);
    assert_eq!(table.len(), 1);
}

#[test]
fn block_state_expires() {
    let (table, clock) = table();
    let session = table.start_request("203.0.113.3".parse().unwrap(), &http::HeaderMap::new());

    let now = clock.epoch_ms();
    session.block_for(Duration::from_secs(60), now);
    assert!(session.blocked(now));
    assert!(session.blocked(now + 59_000));
    assert!(!session.blocked(now + 60_001));
}
