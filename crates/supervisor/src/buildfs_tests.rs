// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn fixture() -> (tempfile::TempDir, BuildFs) {
    let dir = tempfile::tempdir().unwrap();
    let fs = BuildFs::new(dir.path());
    (dir, fs)
}

async fn complete_build(fs: &BuildFs, hash: &str, now_ms: u64) -> PathBuf {
    fs.run_build(hash, now_ms, |scratch| async move {
        std::fs::write(scratch.join("artifact"), hash).map_err(|e| BuildFsError::Build(e.to_string()))
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn full_cycle_selects_the_new_build() {
    let (_dir, fs) = fixture();
    let archive = complete_build(&fs, "abc123", 1_000).await;

    assert!(archive.join("artifact").exists());
    assert_eq!(fs.read_build_id().as_deref(), Some("abc123"));
    assert_eq!(std::fs::read_link(fs.run_link()).unwrap(), archive);
    assert!(!fs.scratch_dir().exists());
}

#[tokio::test]
async fn failed_build_keeps_previous_run() {
    let (_dir, fs) = fixture();
    complete_build(&fs, "v1", 1_000).await;

    let err = fs
        .run_build("v2", 2_000, |_scratch| async move {
            Err(BuildFsError::Build("compiler exploded".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BuildFsError::Build(_)));

    // Previous selection is intact, scratch is gone.
    assert_eq!(fs.read_build_id().as_deref(), Some("v1"));
    assert!(!fs.scratch_dir().exists());
}

#[tokio::test]
async fn clean_drops_everything_but_the_selected_archive() {
    let (dir, fs) = fixture();
    complete_build(&fs, "v1", 1_000).await;
    let selected = std::fs::read_link(fs.run_link()).unwrap();

    // Stale entries from interrupted work.
    std::fs::create_dir(dir.path().join(".build")).unwrap();
    std::fs::create_dir(dir.path().join(".build-0000000000000500")).unwrap();
    // And an unrelated user file that must survive.
    std::fs::write(dir.path().join("app.js"), "x").unwrap();

    fs.clean().unwrap();

    assert!(selected.exists());
    assert!(!dir.path().join(".build").exists());
    assert!(!dir.path().join(".build-0000000000000500").exists());
    assert!(dir.path().join("app.js").exists());
}

#[tokio::test]
async fn rebuild_replaces_selection() {
    let (_dir, fs) = fixture();
    complete_build(&fs, "v1", 1_000).await;
    let second = complete_build(&fs, "v2", 2_000).await;

    assert_eq!(fs.read_build_id().as_deref(), Some("v2"));
    assert_eq!(std::fs::read_link(fs.run_link()).unwrap(), second);
}

#[test]
fn run_dir_falls_back_to_root() {
    let (dir, fs) = fixture();
    assert_eq!(fs.run_dir(), dir.path());
}

#[test]
fn read_build_id_absent_without_run() {
    let (_dir, fs) = fixture();
    assert!(fs.read_build_id().is_none());
}

#[tokio::test]
async fn partial_scratch_is_replaced_on_next_attempt() {
    let (_dir, fs) = fixture();
    let scratch = fs.pre_build().unwrap();
    std::fs::write(scratch.join("half-done"), "x").unwrap();

    // Simulated crash: nothing archived. Next attempt starts fresh.
    let scratch = fs.pre_build().unwrap();
    assert!(!scratch.join("half-done").exists());
}

#[tokio::test]
async fn archives_sort_lexicographically() {
    let (_dir, fs) = fixture();
    let a = complete_build(&fs, "v1", 5).await;
    let b = complete_build(&fs, "v2", 10_000).await;
    let (an, bn) = (
        a.file_name().unwrap().to_string_lossy().to_string(),
        b.file_name().unwrap().to_string_lossy().to_string(),
    );
    assert!(an < bn, "{an} should sort before {bn}");
}
