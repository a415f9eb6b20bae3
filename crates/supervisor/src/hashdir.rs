// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build identity: a content hash of the service root.
//!
//! Gitignore-aware walk (the `ignore` crate honors `.gitignore`,
//! `.ignore`, and global excludes), skipping the build cache entries
//! themselves. Deterministic: entries are hashed in sorted relative-path
//! order.

use sha2::{Digest, Sha256};
use std::path::Path;

/// Entries never part of the build identity.
fn is_cache_entry(name: &str) -> bool {
    name == ".run" || name == ".build" || name.starts_with(".build-") || name == ".git"
}

/// Hash the service root. Returns lowercase hex.
pub fn hash_service_root(root: &Path) -> std::io::Result<String> {
    let mut files: Vec<std::path::PathBuf> = Vec::new();
    let walk = ignore::WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(true)
        .require_git(false)
        .filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| !is_cache_entry(name))
                .unwrap_or(true)
        })
        .build();

    for entry in walk {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            files.push(entry.into_path());
        }
    }
    files.sort();

    let mut hasher = Sha256::new();
    for path in files {
        let rel = path.strip_prefix(root).unwrap_or(&path);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0]);
        let body = std::fs::read(&path)?;
        hasher.update((body.len() as u64).to_le_bytes());
        hasher.update(&body);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn stable_for_unchanged_tree() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/main.js", "console.log(1)");
        write(dir.path(), "package.json", "{}");

        let a = hash_service_root(dir.path()).unwrap();
        let b = hash_service_root(dir.path()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn changes_when_content_changes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.js", "v1");
        let before = hash_service_root(dir.path()).unwrap();

        write(dir.path(), "main.js", "v2");
        let after = hash_service_root(dir.path()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn ignores_build_cache_entries() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.js", "v1");
        let before = hash_service_root(dir.path()).unwrap();

        write(dir.path(), ".build/tmp.js", "scratch");
        write(dir.path(), ".build-0001/out.js", "archived");
        let after = hash_service_root(dir.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn honors_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.js", "v1");
        write(dir.path(), ".gitignore", "node_modules/\n");
        let before = hash_service_root(dir.path()).unwrap();

        write(dir.path(), "node_modules/dep/index.js", "huge");
        let after = hash_service_root(dir.path()).unwrap();
        assert_eq!(before, after);
    }
}
