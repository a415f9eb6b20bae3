// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-origin client sessions.
//!
//! Keyed by trusted origin IP. Reads are lock-free (sharded concurrent
//! map + atomics); a janitor evicts sessions idle past the TTL. Local and
//! private origins share one distinguished session that bypasses rate
//! limiting.

use crate::ipinfo::IpInfoStack;
use dashmap::DashMap;
use pm3_core::{ip_hash, Clock};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sessions idle longer than this are evicted.
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 60);
/// Janitor cadence.
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Fixed-window rate bucket. Packed into two atomics so enforcement is a
/// CAS, not a lock.
#[derive(Default)]
pub struct RateBucket {
    /// Window start, epoch ms.
    pub window_start: AtomicU64,
    /// Requests seen inside the window.
    pub count: AtomicU64,
}

/// One client session.
pub struct ClientSession {
    pub ip: IpAddr,
    /// Stable 32-bit hash for balancer entropy.
    pub ip_hash: u32,
    /// Distinguished local/private origin; exempt from rate limits.
    pub local: bool,
    pub first_seen_ms: u64,
    pub last_seen_ms: AtomicU64,
    pub requests: AtomicU64,
    /// Epoch-ms until which the client is blocked; 0 = not blocked.
    pub blocked_until_ms: AtomicU64,
    /// Precomputed ip-info response headers (ASN, country, flags).
    pub info_headers: Vec<(String, String)>,
    /// Country hint adopted from a trusted edge (e.g. Cloudflare).
    pub country: parking_lot::Mutex<Option<String>>,
    /// Per-key storage for handlers (sticky slots, switch vars).
    pub vars: DashMap<String, String>,
    /// Sticky upstream slots, keyed per load balancer.
    pub sticky: DashMap<String, std::sync::Weak<crate::upstream::Upstream>>,
    /// Rate buckets, keyed per limit spec.
    pub buckets: DashMap<String, Arc<RateBucket>>,
}

impl ClientSession {
    fn new(ip: IpAddr, local: bool, now_ms: u64, info_headers: Vec<(String, String)>) -> Self {
        Self {
            ip,
            ip_hash: ip_hash(&ip),
            local,
            first_seen_ms: now_ms,
            last_seen_ms: AtomicU64::new(now_ms),
            requests: AtomicU64::new(0),
            blocked_until_ms: AtomicU64::new(0),
            info_headers,
            country: parking_lot::Mutex::new(None),
            vars: DashMap::new(),
            sticky: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_seen_ms.store(now_ms, Ordering::Relaxed);
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blocked(&self, now_ms: u64) -> bool {
        let until = self.blocked_until_ms.load(Ordering::Relaxed);
        until != 0 && now_ms < until
    }

    pub fn block_for(&self, duration: Duration, now_ms: u64) {
        self.blocked_until_ms
            .store(now_ms + duration.as_millis() as u64, Ordering::Relaxed);
    }
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Process-wide session table.
pub struct SessionTable<C: Clock> {
    clock: C,
    sessions: DashMap<IpAddr, Arc<ClientSession>>,
    local: Arc<ClientSession>,
    ipinfo: arc_swap::ArcSwap<IpInfoStack>,
}

impl<C: Clock> SessionTable<C> {
    pub fn new(clock: C, ipinfo: Arc<IpInfoStack>) -> Self {
        let now = clock.epoch_ms();
        let local_ip: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        Self {
            clock,
            sessions: DashMap::new(),
            local: Arc::new(ClientSession::new(local_ip, true, now, Vec::new())),
            ipinfo: arc_swap::ArcSwap::new(ipinfo),
        }
    }

    /// Swap the provider stack (reload).
    pub fn set_ipinfo(&self, stack: Arc<IpInfoStack>) {
        self.ipinfo.store(stack);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Resolve the trusted origin IP and start (or continue) its session.
    ///
    /// Trust rules: the socket peer is trusted. `X-Forwarded-For` is
    /// honored only when the peer is loopback/private, taking the first
    /// public hop. `CF-Connecting-IP` is honored only when the peer is in
    /// the Cloudflare ranges, adopting the `CF-IPCountry` hint too.
    pub fn start_request(&self, peer: IpAddr, headers: &http::HeaderMap) -> Arc<ClientSession> {
        let mut origin = peer;
        let mut country_hint: Option<String> = None;

        if is_private(&peer) {
            if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
                origin = xff
                    .split(',')
                    .filter_map(|part| part.trim().parse::<IpAddr>().ok())
                    .find(|ip| !is_private(ip))
                    .unwrap_or(origin);
            }
        } else if self.ipinfo.load().is_cloudflare(&peer) {
            if let Some(cf) = headers.get("cf-connecting-ip").and_then(|v| v.to_str().ok()) {
                if let Ok(ip) = cf.trim().parse::<IpAddr>() {
                    origin = ip;
                    country_hint = headers
                        .get("cf-ipcountry")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                }
            }
        }

        let now = self.clock.epoch_ms();
        if is_private(&origin) {
            self.local.touch(now);
            return Arc::clone(&self.local);
        }

        let session = self
            .sessions
            .entry(origin)
            .or_insert_with(|| {
                let headers = self.ipinfo.load().headers_for(&origin);
                Arc::new(ClientSession::new(origin, false, now, headers))
            })
            .clone();
        session.touch(now);
        if let Some(hint) = country_hint {
            *session.country.lock() = Some(hint);
        }
        session
    }

    /// Evict sessions idle past the TTL.
    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.epoch_ms().saturating_sub(SESSION_TTL.as_millis() as u64);
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| s.last_seen_ms.load(Ordering::Relaxed) >= cutoff);
        before - self.sessions.len()
    }

    /// Run the eviction janitor until cancelled.
    pub fn spawn_janitor(self: &Arc<Self>, cancel: CancellationToken) {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(JANITOR_INTERVAL);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {
                        let evicted = table.sweep();
                        if evicted > 0 {
                            tracing::debug!(evicted, "session janitor sweep");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
