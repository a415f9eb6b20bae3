// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subject algebra.
//!
//! Subjects are dot-separated token lists. `*` matches exactly one token,
//! `>` matches one or more trailing tokens. Two prefixes are reserved:
//! `jet.` routes through a durable stream (second token names the stream),
//! and `$local.` scopes a subject to one machine.

/// Durable-stream prefix: `jet.<stream>.<subject...>`.
pub const JET_PREFIX: &str = "jet.";
/// Machine-local prefix.
pub const LOCAL_PREFIX: &str = "$local.";

/// Token-wise subject match.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            _ => return false,
        }
    }
}

/// Derive a queue-group name from a subject pattern: dots become dashes,
/// `>` becomes `all`, `*` becomes `any`.
pub fn queue_group(subject: &str) -> String {
    subject
        .split('.')
        .map(|tok| match tok {
            ">" => "all",
            "*" => "any",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Split a `jet.`-prefixed subject into `(stream, filter)`. The filter is
/// the remainder after the stream token (empty means the whole stream).
pub fn jet_parts(subject: &str) -> Option<(&str, &str)> {
    let rest = subject.strip_prefix(JET_PREFIX)?;
    match rest.split_once('.') {
        Some((stream, filter)) => Some((stream, filter)),
        None => Some((rest, "")),
    }
}

/// Map a manifest subject to the broker-native subject for this machine.
/// `$local.x` becomes `$local.<machine>.x`; everything else is unchanged.
pub fn native(subject: &str, machine_id: &str) -> String {
    match subject.strip_prefix(LOCAL_PREFIX) {
        Some(rest) => format!("{LOCAL_PREFIX}{machine_id}.{rest}"),
        None => subject.to_string(),
    }
}

/// Subject tokens as a URL path: dots become slashes. Used by the runner to
/// synthesize request URLs.
pub fn as_path(subject: &str) -> String {
    format!("/{}", subject.replace('.', "/"))
}

#[cfg(test)]
#[path = "subject_tests.rs"]
mod tests;
