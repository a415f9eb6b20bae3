// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[yare::parameterized(
    exact = { "a.b", "a.b", true },
    star = { "a.*", "a.b", true },
    star_not_deep = { "a.*", "a.b.c", false },
    gt_tail = { "a.>", "a.b.c", true },
    gt_needs_one = { "a.>", "a", false },
    mismatch = { "a.b", "a.c", false },
    longer_subject = { "a.b", "a.b.c", false },
    star_middle = { "a.*.c", "a.b.c", true },
)]
fn subject_matching(pattern: &str, subject: &str, want: bool) {
    assert_eq!(matches(pattern, subject), want, "{pattern} vs {subject}");
}

#[yare::parameterized(
    plain = { "jobs.resize", "jobs-resize" },
    wild_all = { "jobs.>", "jobs-all" },
    wild_any = { "jobs.*.done", "jobs-any-done" },
)]
fn queue_group_derivation(subject: &str, want: &str) {
    assert_eq!(queue_group(subject), want);
}

#[test]
fn jet_parts_split() {
    assert_eq!(jet_parts("jet.jobs.resize"), Some(("jobs", "resize")));
    assert_eq!(jet_parts("jet.jobs"), Some(("jobs", "")));
    assert_eq!(jet_parts("jobs.resize"), None);
}

#[test]
fn local_subjects_gain_machine_scope() {
    assert_eq!(native("$local.cache.flush", "m1"), "$local.m1.cache.flush");
    assert_eq!(native("jobs.resize", "m1"), "jobs.resize");
}

#[test]
fn subject_as_path() {
    assert_eq!(as_path("jobs.resize"), "/jobs/resize");
}
