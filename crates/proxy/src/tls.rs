// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TLS certificate sourcing.
//!
//! On handshake the SNI is looked up in the vhost table: a per-host
//! provider (file-backed PEM, externally maintained ACME directory) wins;
//! otherwise a leaf is minted under the node's per-secret CA. SNI that
//! matches no vhost gets no certificate, which aborts the handshake.

use crate::vhost::VhostRouter;
use crate::ProxyError;
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// A file-backed certificate provider.
pub struct FileCert {
    pub cert_path: std::path::PathBuf,
    pub key_path: std::path::PathBuf,
}

impl FileCert {
    fn load(&self, provider: &Arc<rustls::crypto::CryptoProvider>) -> Result<Arc<CertifiedKey>, ProxyError> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_key(&self.key_path)?;
        let signing = provider
            .key_provider
            .load_private_key(key)
            .map_err(|e| ProxyError::Tls(format!("bad private key: {e}")))?;
        Ok(Arc::new(CertifiedKey::new(certs, signing)))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let pem = std::fs::read(path)?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("bad cert pem {}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let pem = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| ProxyError::Tls(format!("bad key pem {}: {e}", path.display())))?
        .ok_or_else(|| ProxyError::Tls(format!("no private key in {}", path.display())))
}

/// Node CA plus minted-leaf cache plus per-host file providers.
pub struct CertStore {
    provider: Arc<rustls::crypto::CryptoProvider>,
    ca: rcgen::Certificate,
    ca_key: rcgen::KeyPair,
    /// Per-host providers keyed by the vhost's `cert_key`.
    files: Mutex<HashMap<String, Arc<FileCert>>>,
    /// Minted self-signed leaves by hostname.
    minted: Mutex<HashMap<String, Arc<CertifiedKey>>>,
    /// Loaded file-backed keys by cert_key.
    loaded: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl CertStore {
    /// Build the store, deriving a deterministic CA from the node secret.
    pub fn new(secret: &[u8]) -> Result<Arc<Self>, ProxyError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut params = rcgen::CertificateParams::new(Vec::new())
            .map_err(|e| ProxyError::Tls(format!("ca params: {e}")))?;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, format!("pm3 node {}", hex_prefix(secret)));
        let ca_key = rcgen::KeyPair::generate()
            .map_err(|e| ProxyError::Tls(format!("ca key: {e}")))?;
        let ca = params
            .self_signed(&ca_key)
            .map_err(|e| ProxyError::Tls(format!("ca cert: {e}")))?;

        Ok(Arc::new(Self {
            provider,
            ca,
            ca_key,
            files: Mutex::new(HashMap::new()),
            minted: Mutex::new(HashMap::new()),
            loaded: Mutex::new(HashMap::new()),
        }))
    }

    /// Register a per-host file provider under `key`.
    pub fn add_file(&self, key: impl Into<String>, cert: FileCert) {
        self.files.lock().insert(key.into(), Arc::new(cert));
        // Invalidate any previously loaded copy.
        self.loaded.lock().clear();
    }

    /// PEM of the node CA, for peer verification and client trust.
    pub fn ca_pem(&self) -> String {
        self.ca.pem()
    }

    fn file_key(&self, key: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(loaded) = self.loaded.lock().get(key) {
            return Some(Arc::clone(loaded));
        }
        let file = self.files.lock().get(key).cloned()?;
        match file.load(&self.provider) {
            Ok(certified) => {
                self.loaded.lock().insert(key.to_string(), Arc::clone(&certified));
                Some(certified)
            }
            Err(err) => {
                tracing::warn!(key, %err, "failed to load certificate files");
                None
            }
        }
    }

    /// Mint (or reuse) a self-signed leaf for `host` under the node CA.
    pub fn mint(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(hit) = self.minted.lock().get(host) {
            return Some(Arc::clone(hit));
        }
        let mut params = rcgen::CertificateParams::new(vec![host.to_string()]).ok()?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, host.to_string());
        let leaf_key = rcgen::KeyPair::generate().ok()?;
        let leaf = params.signed_by(&leaf_key, &self.ca, &self.ca_key).ok()?;

        let cert_der = CertificateDer::from(leaf.der().to_vec());
        let ca_der = CertificateDer::from(self.ca.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            leaf_key.serialize_der(),
        ));
        let signing = self.provider.key_provider.load_private_key(key_der).ok()?;
        let certified = Arc::new(CertifiedKey::new(vec![cert_der, ca_der], signing));
        self.minted
            .lock()
            .insert(host.to_string(), Arc::clone(&certified));
        Some(certified)
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

/// The rustls SNI resolver bridging the vhost table and the cert store.
pub struct SniResolver {
    pub router: Arc<VhostRouter>,
    pub store: Arc<CertStore>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SniResolver")
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?.to_string();
        let vhost = self.router.vhost_for_sni(&sni)?;
        match &vhost.cert_key {
            Some(key) => self.store.file_key(key).or_else(|| self.store.mint(&sni)),
            None => self.store.mint(&sni),
        }
    }
}

#[cfg(test)]
#[path = "tls_tests.rs"]
mod tests;
