// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Signed URLs.
//!
//! `pexp` (epoch-seconds expiry) and `psig` (hex HMAC-SHA256 over
//! `<path>|<pexp>` under the node secret) ride as query parameters. A
//! valid signature proves the request internal; a tampered one is a hard
//! failure.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIG_PARAM: &str = "psig";
pub const EXP_PARAM: &str = "pexp";

/// Outcome of signature verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignedVerdict {
    /// No signature parameters present; pass through untouched.
    Unsigned,
    /// Valid; the caller injects `P-Internal: 1` and strips the params.
    Valid,
    /// Tampered or expired.
    Invalid,
}

fn signature(secret: &[u8], path: &str, exp: u64) -> String {
    // Key material is the node secret; construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(path.as_bytes());
    mac.update(b"|");
    mac.update(exp.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Sign `path` until `exp` (epoch seconds). Returns the query-string tail.
pub fn sign_url(secret: &[u8], path: &str, exp: u64) -> String {
    let sig = signature(secret, path, exp);
    format!("{EXP_PARAM}={exp}&{SIG_PARAM}={sig}")
}

fn query_param<'q>(query: &'q str, name: &str) -> Option<&'q str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then_some(v)
    })
}

/// Verify the signature parameters on `path` + `query` at `now` (epoch
/// seconds). Constant-time comparison via the hmac verifier.
pub fn verify_signed(secret: &[u8], path: &str, query: &str, now: u64) -> SignedVerdict {
    let sig = query_param(query, SIG_PARAM);
    let exp = query_param(query, EXP_PARAM);
    let (Some(sig), Some(exp)) = (sig, exp) else {
        if sig.is_some() || exp.is_some() {
            // Half a signature is tampering, not absence.
            return SignedVerdict::Invalid;
        }
        return SignedVerdict::Unsigned;
    };

    let Ok(exp_secs) = exp.parse::<u64>() else {
        return SignedVerdict::Invalid;
    };
    if exp_secs < now {
        return SignedVerdict::Invalid;
    }

    let Ok(presented) = hex::decode(sig) else {
        return SignedVerdict::Invalid;
    };
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return SignedVerdict::Invalid,
    };
    mac.update(path.as_bytes());
    mac.update(b"|");
    mac.update(exp_secs.to_string().as_bytes());
    match mac.verify_slice(&presented) {
        Ok(()) => SignedVerdict::Valid,
        Err(_) => SignedVerdict::Invalid,
    }
}

/// Strip the signature parameters from a query string.
pub fn strip_signature(query: &str) -> String {
    query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or("");
            key != SIG_PARAM && key != EXP_PARAM
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
#[path = "signed_tests.rs"]
mod tests;
