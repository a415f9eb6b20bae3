// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Virtual-host routing.
//!
//! A reload builds two structures: an ordered list of vhost groups (all
//! hosts sharing a root domain, in declaration order, for deterministic
//! fallthrough) and a hostname map for certificate lookup. Both swap in
//! atomically.

use crate::handler::{Exchange, Flow, Pipeline};
use arc_swap::ArcSwap;
use pm3_core::EdgeError;
use std::collections::HashMap;
use std::sync::Arc;

/// One virtual host: hostname list, pipeline, options.
pub struct Vhost {
    /// Hostnames; a leftmost empty component (`.example.com` written as
    /// `*.example.com` or bare root) matches any subdomain prefix.
    pub hostnames: Vec<String>,
    pub pipeline: Pipeline,
    pub no_upgrade: bool,
    /// Cert provider key into the [`crate::tls::CertStore`]; `None` mints
    /// a self-signed leaf from the node CA.
    pub cert_key: Option<String>,
}

impl Vhost {
    /// Whether `host`'s leftmost components are a possibly-empty prefix
    /// ending with one of this vhost's hostnames.
    pub fn matches_host(&self, host: &str) -> bool {
        self.hostnames.iter().any(|name| host_matches(name, host))
    }
}

/// `pattern` may carry a leading `*.` (any subdomain, including none).
pub fn host_matches(pattern: &str, host: &str) -> bool {
    if let Some(root) = pattern.strip_prefix("*.") {
        host == root || host.ends_with(&format!(".{root}"))
    } else {
        pattern == host
    }
}

/// Root domain a hostname groups under: the last two labels.
pub fn root_domain(host: &str) -> String {
    let labels: Vec<&str> = host.trim_start_matches("*.").split('.').collect();
    if labels.len() <= 2 {
        labels.join(".")
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

/// All vhosts sharing a root domain, in declaration order.
pub struct VhostGroup {
    pub root: String,
    pub members: Vec<Arc<Vhost>>,
}

impl VhostGroup {
    pub fn matches_host(&self, host: &str) -> bool {
        host == self.root || host.ends_with(&format!(".{}", self.root))
    }
}

/// Atomically swapped routing state.
#[derive(Default)]
struct RouteTable {
    groups: Vec<Arc<VhostGroup>>,
    by_host: HashMap<String, Arc<Vhost>>,
}

/// The router the proxy server dispatches into.
pub struct VhostRouter {
    table: ArcSwap<RouteTable>,
}

impl Default for VhostRouter {
    fn default() -> Self {
        Self { table: ArcSwap::from_pointee(RouteTable::default()) }
    }
}

impl VhostRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh vhost set (reload). Grouping preserves declaration
    /// order both across and inside groups.
    pub fn install(&self, vhosts: Vec<Arc<Vhost>>) {
        let mut groups: Vec<(String, Vec<Arc<Vhost>>)> = Vec::new();
        let mut by_host = HashMap::new();
        for vhost in vhosts {
            for name in &vhost.hostnames {
                by_host
                    .entry(name.trim_start_matches("*.").to_string())
                    .or_insert_with(|| Arc::clone(&vhost));
            }
            let root = vhost
                .hostnames
                .first()
                .map(|h| root_domain(h))
                .unwrap_or_default();
            match groups.iter_mut().find(|(r, _)| *r == root) {
                Some((_, members)) => members.push(vhost),
                None => groups.push((root, vec![vhost])),
            }
        }
        let groups = groups
            .into_iter()
            .map(|(root, members)| Arc::new(VhostGroup { root, members }))
            .collect();
        self.table.store(Arc::new(RouteTable { groups, by_host }));
    }

    /// Whether any vhost serves `host`.
    pub fn knows_host(&self, host: &str) -> bool {
        let table = self.table.load();
        table.groups.iter().any(|g| g.matches_host(host))
    }

    /// Certificate lookup for a TLS SNI.
    pub fn vhost_for_sni(&self, sni: &str) -> Option<Arc<Vhost>> {
        let table = self.table.load();
        if let Some(exact) = table.by_host.get(sni) {
            return Some(Arc::clone(exact));
        }
        table
            .groups
            .iter()
            .flat_map(|g| g.members.iter())
            .find(|v| v.matches_host(sni))
            .cloned()
    }

    /// Dispatch an exchange through the matching group.
    ///
    /// Within the group each member vhost runs sequentially: `Done` and
    /// `Drop` stop; `Continue` falls through to the next member. The
    /// HTTP->HTTPS upgrade is answered here because it needs the member's
    /// opt-out flag.
    pub async fn dispatch(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        let host = cx.host().to_string();
        let table = self.table.load_full();

        for group in table.groups.iter().filter(|g| g.matches_host(&host)) {
            for vhost in &group.members {
                if !vhost.matches_host(&host) {
                    continue;
                }

                if let Some(flow) = self.maybe_upgrade(cx, vhost, &host) {
                    return Ok(flow);
                }

                match vhost.pipeline.run(cx).await? {
                    Flow::Continue => continue,
                    flow => return Ok(flow),
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// 301 to https when the client asked for it and the vhost allows it.
    fn maybe_upgrade(&self, cx: &mut Exchange, vhost: &Vhost, host: &str) -> Option<Flow> {
        let wants_upgrade = cx
            .headers
            .get("upgrade-insecure-requests")
            .and_then(|v| v.to_str().ok())
            == Some("1");
        if cx.scheme != crate::handler::Scheme::Http
            || !wants_upgrade
            || vhost.no_upgrade
            || cx.portal_hops > 0
        {
            return None;
        }
        let target = format!(
            "https://{host}{}",
            cx.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );
        let mut resp = crate::handler::Response::new(301);
        if let Ok(v) = http::HeaderValue::from_str(&target) {
            resp.headers.insert(http::header::LOCATION, v);
        }
        Some(cx.respond(resp))
    }
}

#[cfg(test)]
#[path = "vhost_tests.rs"]
mod tests;
