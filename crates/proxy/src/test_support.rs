// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for proxy tests.

use crate::handler::{Exchange, Scheme};
use crate::ipinfo::IpInfoStack;
use crate::session::{ClientSession, SessionTable};
use bytes::Bytes;
use pm3_core::{new_ray_id, FakeClock};
use std::net::IpAddr;
use std::sync::Arc;

pub fn table() -> (Arc<SessionTable<FakeClock>>, FakeClock) {
    let clock = FakeClock::new();
    let table = Arc::new(SessionTable::new(clock.clone(), Arc::new(IpInfoStack::builtin())));
    (table, clock)
}

pub fn public_session(table: &SessionTable<FakeClock>) -> Arc<ClientSession> {
    let ip: IpAddr = "203.0.113.7".parse().unwrap();
    table.start_request(ip, &http::HeaderMap::new())
}

pub fn local_session(table: &SessionTable<FakeClock>) -> Arc<ClientSession> {
    let ip: IpAddr = "127.0.0.1".parse().unwrap();
    table.start_request(ip, &http::HeaderMap::new())
}

pub fn exchange(host: &str, path: &str, session: Arc<ClientSession>) -> Exchange {
    exchange_with_method(http::Method::GET, host, path, session)
}

pub fn exchange_with_method(
    method: http::Method,
    host: &str,
    path: &str,
    session: Arc<ClientSession>,
) -> Exchange {
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::HOST, host.parse().unwrap());
    Exchange::new(
        method,
        path.parse().unwrap(),
        headers,
        Bytes::new(),
        Scheme::Https,
        session,
        new_ray_id(),
    )
}
