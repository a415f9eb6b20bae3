// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use proptest::prelude::*;

#[yare::parameterized(
    wildcard_empty = { "", "any.host", "/x", true },
    wildcard_underscore = { "_", "any.host", "/x", true },
    exact_hit = { "example.com/health", "example.com", "/health", true },
    exact_miss = { "example.com/health", "example.com", "/healthz", false },
    prefix_slash = { "example.com/api/", "example.com", "/api/v1", true },
    prefix_plus = { "example.com/api+", "example.com", "/api-v2", true },
    prefix_miss = { "example.com/api/", "example.com", "/app", false },
    suffix = { "+.js", "cdn.example.com", "/app.js", true },
    suffix_miss = { "+.js", "cdn.example.com", "/app.css", false },
    regex_hit = { "~.*/v[0-9]+/.*", "example.com", "/api/v2/users", true },
    regex_anchored = { "~example.com", "example.com", "/x", false },
    alternation = { "a.com/x, b.com/y", "b.com", "/y", true },
    alternation_miss = { "a.com/x, b.com/y", "c.com", "/y", false },
)]
fn matching(pattern: &str, host: &str, path: &str, want: bool) {
    let p = Pattern::parse(pattern).unwrap();
    assert_eq!(p.matches(host, path), want, "{pattern} vs {host}{path}");
}

#[test]
fn rejects_bad_regex() {
    assert!(Pattern::parse("~([").is_err());
}

#[yare::parameterized(
    wildcard = { "_" },
    exact = { "example.com/health" },
    prefix = { "example.com/api/" },
    prefix_plus = { "api+" },
    suffix = { "+.js" },
    regex = { "~.*\\.png" },
    alternation = { "a.com, b.com/x, +.css" },
)]
fn format_parse_is_idempotent(input: &str) {
    let once = Pattern::parse(input).unwrap();
    let again = Pattern::parse(&once.to_string()).unwrap();
    assert_eq!(once, again, "{input} -> {once}");
}

proptest! {
    /// parse(format(parse(p))) == parse(p) over literal-ish inputs.
    #[test]
    fn parse_format_parse(host in "[a-z]{1,8}\\.com", path in "/[a-z0-9/]{0,12}") {
        let input = format!("{host}{path}");
        let once = Pattern::parse(&input).unwrap();
        let again = Pattern::parse(&once.to_string()).unwrap();
        prop_assert_eq!(once, again);
    }

    /// Matching is a pure function of (host, path).
    #[test]
    fn matching_is_stateless(path in "/[a-z0-9/]{0,16}") {
        let p = Pattern::parse("example.com/api/").unwrap();
        let first = p.matches("example.com", &path);
        for _ in 0..3 {
            prop_assert_eq!(p.matches("example.com", &path), first);
        }
    }
}
