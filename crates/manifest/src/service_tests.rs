// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[yare::parameterized(
    fixed = { ClusterSize::Fixed(3), 8, 3 },
    fixed_floor = { ClusterSize::Fixed(0), 8, 1 },
    half = { ClusterSize::Percent(50), 8, 4 },
    percent_floor = { ClusterSize::Percent(10), 4, 1 },
    full = { ClusterSize::Percent(100), 8, 8 },
)]
fn cluster_size_resolution(size: ClusterSize, cpus: u32, want: u32) {
    assert_eq!(size.resolve(cpus), want);
}

#[test]
fn cluster_size_serde() {
    let fixed: ClusterSize = serde_yaml::from_str("3").unwrap();
    assert_eq!(fixed, ClusterSize::Fixed(3));

    let pct: ClusterSize = serde_yaml::from_str("\"50%\"").unwrap();
    assert_eq!(pct, ClusterSize::Percent(50));

    assert!(serde_yaml::from_str::<ClusterSize>("\"half\"").is_err());
}

#[test]
fn single_cluster_is_min_and_max() {
    let range: ClusterRange = serde_yaml::from_str("2").unwrap();
    assert_eq!(range.resolve(8), (2, 2));
}

#[test]
fn wrapper_overlay_survives_lowering() {
    let mut spec: ServiceSpec = serde_yaml::from_str(
        r#"
!Js
root: ./w
main: app.js
cluster: 2
env: { DEBUG: "1" }
"#,
    )
    .unwrap();
    spec.prepare("w").unwrap();
    match spec {
        ServiceSpec::Proc(proc) => {
            assert_eq!(proc.run, "node app.js");
            assert_eq!(proc.cluster.resolve(1), (2, 2));
            assert_eq!(proc.env.get("DEBUG").map(String::as_str), Some("1"));
        }
        other => panic!("expected proc, got {other:?}"),
    }
}

#[test]
fn explicit_run_wins_over_wrapper_default() {
    let mut spec: ServiceSpec = serde_yaml::from_str(
        r#"
!Npm
root: ./w
run: "npm run serve"
"#,
    )
    .unwrap();
    spec.prepare("w").unwrap();
    match spec {
        ServiceSpec::Proc(proc) => assert_eq!(proc.run, "npm run serve"),
        other => panic!("expected proc, got {other:?}"),
    }
}

#[test]
fn go_wrapper_builds_named_binary() {
    let mut spec: ServiceSpec = serde_yaml::from_str("!Go { root: ./svc }").unwrap();
    spec.prepare("svc").unwrap();
    match spec {
        ServiceSpec::Proc(proc) => {
            assert_eq!(proc.build, vec!["go build -o ./.pm3-svc .".to_string()]);
            assert_eq!(proc.run, "./.pm3-svc");
        }
        other => panic!("expected proc, got {other:?}"),
    }
}

#[test]
fn timeouts_have_defaults() {
    let spec: ProcSpec = serde_yaml::from_str("root: ./x\nrun: ./x").unwrap();
    assert_eq!(spec.ready_timeout, Duration::from_secs(30));
    assert_eq!(spec.stop_timeout, Duration::from_secs(20));
    assert_eq!(spec.unhealthy_timeout, Duration::from_secs(10));
}

#[test]
fn bad_fileserver_filter_rejected() {
    let spec: ServiceSpec = serde_yaml::from_str("!FileServer { root: ./x, filter: '([' }").unwrap();
    assert!(spec.validate("x").is_err());
}
