// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IP-info provider seam.
//!
//! The lookups themselves (ASN databases, Maxmind, edge lists) are
//! external collaborators; this module defines the provider contract, a
//! builtin provider covering the Cloudflare and private ranges, a
//! marker-list provider, and the stale-while-revalidate cache wrapper the
//! stack hangs providers on.

use arc_swap::ArcSwap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Refetch window for refresh-behind providers.
pub const REFRESH_WINDOW: Duration = Duration::from_secs(4 * 60 * 60);

/// What a provider knows about one address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IpInfo {
    pub asn: Option<u32>,
    pub country: Option<String>,
    pub vpn: bool,
    pub cloudflare: bool,
    pub marked: bool,
}

/// One provider in the stack. Providers answer what they know and pass on
/// the rest; the stack merges in order.
pub trait IpInfoProvider: Send + Sync {
    fn lookup(&self, ip: &IpAddr) -> Option<IpInfo>;
    fn name(&self) -> &str;
}

/// Cloudflare published IPv4 edge ranges.
const CLOUDFLARE_V4: &[(u32, u8)] = &[
    (0x67_15_f4_00, 22), // 103.21.244.0/22
    (0x67_16_c8_00, 22), // 103.22.200.0/22
    (0x67_1f_04_00, 22), // 103.31.4.0/22
    (0x68_10_00_00, 13), // 104.16.0.0/13
    (0x68_18_00_00, 14), // 104.24.0.0/14
    (0x6c_a2_c0_00, 18), // 108.162.192.0/18
    (0x83_00_48_00, 22), // 131.0.72.0/22
    (0x8d_65_40_00, 18), // 141.101.64.0/18
    (0xa2_9e_a0_00, 15), // 162.158.0.0/15
    (0xac_40_00_00, 13), // 172.64.0.0/13
    (0xad_f5_30_00, 20), // 173.245.48.0/20
    (0xbc_72_60_00, 20), // 188.114.96.0/20
    (0xbe_5d_f0_00, 20), // 190.93.240.0/20
    (0xc5_ea_f0_00, 22), // 197.234.240.0/22
    (0xc6_29_80_00, 17), // 198.41.128.0/17
];

fn in_cidr_v4(ip: u32, net: u32, bits: u8) -> bool {
    if bits == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - bits);
    (ip & mask) == (net & mask)
}

/// Builtin provider: Cloudflare edge detection plus private-range marking.
#[derive(Default)]
pub struct BuiltinProvider;

impl IpInfoProvider for BuiltinProvider {
    fn lookup(&self, ip: &IpAddr) -> Option<IpInfo> {
        match ip {
            IpAddr::V4(v4) => {
                let bits = u32::from(*v4);
                let cloudflare = CLOUDFLARE_V4
                    .iter()
                    .any(|(net, len)| in_cidr_v4(bits, *net, *len));
                cloudflare.then(|| IpInfo { cloudflare: true, ..IpInfo::default() })
            }
            IpAddr::V6(_) => None,
        }
    }

    fn name(&self) -> &str {
        "builtin"
    }
}

/// Stale-while-revalidate wrapper: readers always get the current value
/// via an atomic pointer; a refetch is attempted at most once per window.
pub struct RefreshCache<T: Send + Sync + 'static> {
    value: ArcSwap<T>,
    fetched_ms: AtomicU64,
    fetch: Box<dyn Fn() -> Option<T> + Send + Sync>,
}

impl<T: Send + Sync + 'static> RefreshCache<T> {
    pub fn new(initial: T, fetch: impl Fn() -> Option<T> + Send + Sync + 'static) -> Self {
        Self {
            value: ArcSwap::from_pointee(initial),
            fetched_ms: AtomicU64::new(0),
            fetch: Box::new(fetch),
        }
    }

    pub fn get(&self, now_ms: u64) -> Arc<T> {
        let fetched = self.fetched_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(fetched) >= REFRESH_WINDOW.as_millis() as u64 {
            // One winner refreshes; losers keep serving the stale value.
            if self
                .fetched_ms
                .compare_exchange(fetched, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                if let Some(fresh) = (self.fetch)() {
                    self.value.store(Arc::new(fresh));
                }
            }
        }
        self.value.load_full()
    }
}

/// Marker-list provider: newline-separated `a.b.c.d/len` entries, held in
/// a refresh cache so edits land without a reload.
pub struct MarkerProvider {
    cache: RefreshCache<Vec<(u32, u8)>>,
}

impl MarkerProvider {
    pub fn new(path: PathBuf) -> Self {
        let load = move || Some(load_cidrs(&path));
        let initial = load().unwrap_or_default();
        Self { cache: RefreshCache::new(initial, load) }
    }
}

fn load_cidrs(path: &std::path::Path) -> Vec<(u32, u8)> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (addr, len) = line.split_once('/')?;
            let addr: std::net::Ipv4Addr = addr.parse().ok()?;
            let len: u8 = len.parse().ok()?;
            (len <= 32).then_some((u32::from(addr), len))
        })
        .collect()
}

impl IpInfoProvider for MarkerProvider {
    fn lookup(&self, ip: &IpAddr) -> Option<IpInfo> {
        let IpAddr::V4(v4) = ip else { return None };
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let ranges = self.cache.get(now_ms);
        let bits = u32::from(*v4);
        ranges
            .iter()
            .any(|(net, len)| in_cidr_v4(bits, *net, *len))
            .then(|| IpInfo { marked: true, ..IpInfo::default() })
    }

    fn name(&self) -> &str {
        "markers"
    }
}

/// Ordered provider stack; merges every provider's answer.
#[derive(Default)]
pub struct IpInfoStack {
    providers: Vec<Arc<dyn IpInfoProvider>>,
}

impl IpInfoStack {
    pub fn new(providers: Vec<Arc<dyn IpInfoProvider>>) -> Self {
        Self { providers }
    }

    /// Builtin-only stack.
    pub fn builtin() -> Self {
        Self::new(vec![Arc::new(BuiltinProvider)])
    }

    pub fn lookup(&self, ip: &IpAddr) -> IpInfo {
        let mut merged = IpInfo::default();
        for provider in &self.providers {
            if let Some(info) = provider.lookup(ip) {
                merged.asn = merged.asn.or(info.asn);
                merged.country = merged.country.or(info.country);
                merged.vpn |= info.vpn;
                merged.cloudflare |= info.cloudflare;
                merged.marked |= info.marked;
            }
        }
        merged
    }

    pub fn is_cloudflare(&self, ip: &IpAddr) -> bool {
        self.lookup(ip).cloudflare
    }

    /// Precomputed response headers for a session.
    pub fn headers_for(&self, ip: &IpAddr) -> Vec<(String, String)> {
        let info = self.lookup(ip);
        let mut headers = Vec::new();
        if let Some(asn) = info.asn {
            headers.push(("p-asn".to_string(), asn.to_string()));
        }
        if let Some(country) = info.country {
            headers.push(("p-country".to_string(), country));
        }
        if info.vpn {
            headers.push(("p-vpn".to_string(), "1".to_string()));
        }
        if info.cloudflare {
            headers.push(("p-cf".to_string(), "1".to_string()));
        }
        if info.marked {
            headers.push(("p-marked".to_string(), "1".to_string()));
        }
        headers
    }
}

#[cfg(test)]
#[path = "ipinfo_tests.rs"]
mod tests;
