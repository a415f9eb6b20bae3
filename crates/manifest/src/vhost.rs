// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Virtual-host declarations.
//!
//! Handler nodes stay as raw YAML values here; the proxy's registry decides
//! what each one means (explicit `!Tag` or trial-unmarshal). The manifest
//! only shapes the list and the per-host options around them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Certificate source for one virtual host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertSource {
    /// PEM files on disk.
    File { cert: PathBuf, key: PathBuf },
    /// Externally maintained ACME directory under the node certs dir.
    Acme,
}

/// One virtual host entry. The map key is the primary host pattern; `also`
/// adds more hostnames to the same pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VhostSpec {
    /// Additional hostnames served by this vhost.
    pub also: Vec<String>,
    /// Handler pipeline, in order. Raw nodes; see `pm3-proxy` registry.
    pub handlers: Vec<serde_yaml::Value>,
    /// Opt out of the HTTP -> HTTPS upgrade redirect.
    pub no_upgrade: bool,
    /// Per-host certificate source; absent means a minted self-signed cert.
    pub cert: Option<CertSource>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cert_file_source() {
        let spec: VhostSpec = serde_yaml::from_str(
            r#"
            cert: !file { cert: /etc/pm3/a.pem, key: /etc/pm3/a.key }
            no_upgrade: true
            "#,
        )
        .unwrap();
        assert!(matches!(spec.cert, Some(CertSource::File { .. })));
        assert!(spec.no_upgrade);
    }

    #[test]
    fn handlers_stay_raw() {
        let spec: VhostSpec = serde_yaml::from_str(
            r#"
            handlers:
              - "redirect https://example.com"
              - !Service api
            "#,
        )
        .unwrap();
        assert_eq!(spec.handlers.len(), 2);
        assert!(spec.handlers[0].is_string());
    }
}
