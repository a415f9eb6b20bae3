// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Content-addressed build cache with atomic run-dir swap.
//!
//! Layout inside a service root:
//! - `.build/` — scratch for the in-progress build
//! - `.build-<timestamp>/` — archived completed builds
//! - `.run` — symlink to the selected archive
//! - `.run/.buildid` — hex content hash of the selected build
//!
//! An interrupted build leaves either a valid previous `.run` or no
//! `.run`; `.buildid` only ever exists inside completed archives.

use std::path::{Path, PathBuf};
use thiserror::Error;

const SCRATCH: &str = ".build";
const ARCHIVE_PREFIX: &str = ".build-";
const RUN_LINK: &str = ".run";
const BUILD_ID: &str = ".buildid";

#[derive(Debug, Error)]
pub enum BuildFsError {
    #[error("io at {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("build failed: {0}")]
    Build(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> BuildFsError + '_ {
    move |e| BuildFsError::Io(path.to_path_buf(), e)
}

/// Build-cache operations over one service root.
pub struct BuildFs {
    root: PathBuf,
}

impl BuildFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(SCRATCH)
    }

    pub fn run_link(&self) -> PathBuf {
        self.root.join(RUN_LINK)
    }

    /// The directory processes run in: the selected archive, or the root
    /// itself when no build has ever completed.
    pub fn run_dir(&self) -> PathBuf {
        let link = self.run_link();
        if link.exists() {
            link
        } else {
            self.root.clone()
        }
    }

    /// Drop every build entry except the target of the `.run` link.
    pub fn clean(&self) -> Result<(), BuildFsError> {
        let keep = std::fs::read_link(self.run_link())
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_os_string()));

        let entries = std::fs::read_dir(&self.root).map_err(io_err(&self.root))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            let is_archive = name_str.starts_with(ARCHIVE_PREFIX) || name_str == SCRATCH;
            if !is_archive {
                continue;
            }
            if keep.as_deref() == Some(name.as_os_str()) {
                continue;
            }
            let path = entry.path();
            std::fs::remove_dir_all(&path).map_err(io_err(&path))?;
        }
        Ok(())
    }

    /// Create a fresh scratch directory. A partial `.build/` from an
    /// interrupted attempt is deleted first.
    pub fn pre_build(&self) -> Result<PathBuf, BuildFsError> {
        let scratch = self.scratch_dir();
        if scratch.exists() {
            std::fs::remove_dir_all(&scratch).map_err(io_err(&scratch))?;
        }
        std::fs::create_dir_all(&scratch).map_err(io_err(&scratch))?;
        Ok(scratch)
    }

    /// Remove the scratch directory after a failed build.
    pub fn abort_build(&self) -> Result<(), BuildFsError> {
        let scratch = self.scratch_dir();
        if scratch.exists() {
            std::fs::remove_dir_all(&scratch).map_err(io_err(&scratch))?;
        }
        Ok(())
    }

    /// Archive the scratch dir, stamp the build id, swap the run link.
    pub fn post_build(&self, hash: &str, now_ms: u64) -> Result<PathBuf, BuildFsError> {
        let scratch = self.scratch_dir();
        // Lexicographically sortable timestamp.
        let archive = self.root.join(format!("{ARCHIVE_PREFIX}{now_ms:016}"));
        let link = self.run_link();

        // Writers of `.run` first remove, then recreate.
        if std::fs::symlink_metadata(&link).is_ok() {
            std::fs::remove_file(&link).map_err(io_err(&link))?;
        }
        std::fs::rename(&scratch, &archive).map_err(io_err(&archive))?;

        let id_path = archive.join(BUILD_ID);
        std::fs::write(&id_path, hash).map_err(io_err(&id_path))?;

        if let Err(first) = symlink_dir(&archive, &link) {
            // One retry after unlinking a racing leftover.
            let _ = std::fs::remove_file(&link);
            symlink_dir(&archive, &link).map_err(|_| BuildFsError::Io(link.clone(), first))?;
        }
        Ok(archive)
    }

    /// Hash of the currently selected build, if any.
    pub fn read_build_id(&self) -> Option<String> {
        let id = std::fs::read_to_string(self.run_link().join(BUILD_ID)).ok()?;
        let id = id.trim().to_string();
        (!id.is_empty()).then_some(id)
    }

    /// Full cycle: clean, scratch, `build_fn`, archive, swap.
    pub async fn run_build<F, Fut>(&self, hash: &str, now_ms: u64, build_fn: F) -> Result<PathBuf, BuildFsError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: std::future::Future<Output = Result<(), BuildFsError>>,
    {
        self.clean()?;
        let scratch = self.pre_build()?;
        if let Err(err) = build_fn(scratch).await {
            self.abort_build()?;
            return Err(err);
        }
        self.post_build(hash, now_ms)
    }
}

fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }
    #[cfg(not(unix))]
    {
        std::fs::hard_link(target, link)
    }
}

#[cfg(test)]
#[path = "buildfs_tests.rs"]
mod tests;
