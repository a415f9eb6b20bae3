// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

const SECRET: &[u8] = b"node-secret-material";

#[test]
fn unsigned_requests_pass_through() {
    assert_eq!(verify_signed(SECRET, "/x", "", 1000), SignedVerdict::Unsigned);
    assert_eq!(
        verify_signed(SECRET, "/x", "a=1&b=2", 1000),
        SignedVerdict::Unsigned
    );
}

#[test]
fn valid_signature_verifies() {
    let query = sign_url(SECRET, "/download/file.zip", 2_000);
    assert_eq!(
        verify_signed(SECRET, "/download/file.zip", &query, 1_999),
        SignedVerdict::Valid
    );
}

#[test]
fn expired_signature_fails() {
    let query = sign_url(SECRET, "/x", 1_000);
    assert_eq!(verify_signed(SECRET, "/x", &query, 1_001), SignedVerdict::Invalid);
}

#[test]
fn tampered_signature_fails() {
    let query = sign_url(SECRET, "/x", 2_000);
    let tampered = query.replace("psig=", "psig=00");
    assert_eq!(verify_signed(SECRET, "/x", &tampered, 1_000), SignedVerdict::Invalid);
}

#[test]
fn signature_is_path_bound() {
    let query = sign_url(SECRET, "/allowed", 2_000);
    assert_eq!(
        verify_signed(SECRET, "/forbidden", &query, 1_000),
        SignedVerdict::Invalid
    );
}

#[test]
fn half_a_signature_is_tampering() {
    assert_eq!(
        verify_signed(SECRET, "/x", "pexp=2000", 1_000),
        SignedVerdict::Invalid
    );
    assert_eq!(
        verify_signed(SECRET, "/x", "psig=abcd", 1_000),
        SignedVerdict::Invalid
    );
}

#[test]
fn strip_removes_only_signature_params() {
    let query = format!("a=1&{}&b=2", sign_url(SECRET, "/x", 2_000));
    assert_eq!(strip_signature(&query), "a=1&b=2");
    assert_eq!(strip_signature("a=1"), "a=1");
}

#[test]
fn secrets_do_not_cross() {
    let query = sign_url(SECRET, "/x", 2_000);
    assert_eq!(
        verify_signed(b"other-secret", "/x", &query, 1_000),
        SignedVerdict::Invalid
    );
}
