// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory file server.
//!
//! On start the whole root loads into memory (under an optional regex
//! filter), precompressing a Brotli body for anything not already
//! compressed by format, and only when compression actually pays (<90% of
//! the original).

use async_trait::async_trait;
use bytes::Bytes;
use pm3_core::EdgeError;
use pm3_manifest::FileServerSpec;
use pm3_proxy::{clean_path, Exchange, Flow, Handler, Response};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

/// Formats that are already entropy-coded; recompressing wastes cycles.
const NO_COMPRESS_EXTS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "avif", "mp4", "webm", "mp3", "ogg", "flac", "woff",
    "woff2", "zip", "gz", "br", "zst", "7z", "pdf",
];

/// Precompressed bodies must beat this fraction of the original.
const COMPRESS_RATIO: f64 = 0.9;

const YEAR_CACHE: &str = "public, max-age=31536000, immutable";

fn content_type(ext: &str) -> &'static str {
    match ext {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "ico" => "image/x-icon",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

struct FileEntry {
    body: Bytes,
    brotli: Option<Bytes>,
    content_type: &'static str,
}

/// See module docs.
pub struct FileServer {
    files: HashMap<String, FileEntry>,
    index: String,
    not_found: Option<String>,
    immutable: bool,
}

impl FileServer {
    /// Walk and load the root.
    pub fn load(spec: &FileServerSpec) -> std::io::Result<Self> {
        let filter = spec
            .filter
            .as_deref()
            .map(regex::Regex::new)
            .transpose()
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        let mut files = HashMap::new();
        let walk = ignore::WalkBuilder::new(&spec.root)
            .hidden(false)
            .git_ignore(false)
            .require_git(false)
            .filter_entry(|entry| entry.file_name().to_str() != Some(".git"))
            .build();
        for entry in walk.flatten() {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&spec.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if let Some(filter) = &filter {
                if !filter.is_match(&rel) {
                    continue;
                }
            }
            files.insert(format!("/{rel}"), load_entry(entry.path())?);
        }

        tracing::debug!(files = files.len(), root = %spec.root.display(), "file server loaded");
        Ok(Self {
            files,
            index: spec.index.clone(),
            not_found: spec.not_found.clone(),
            immutable: spec.immutable,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn resolve(&self, raw_path: &str) -> Option<(&str, &FileEntry)> {
        let path = clean_path(raw_path);
        if let Some((key, entry)) = self.files.get_key_value(path.as_str()) {
            return Some((key.as_str(), entry));
        }
        // Directories try the index file.
        let index_path = if path.ends_with('/') {
            format!("{path}{}", self.index)
        } else {
            format!("{path}/{}", self.index)
        };
        self.files
            .get_key_value(index_path.as_str())
            .map(|(key, entry)| (key.as_str(), entry))
    }
}

fn load_entry(path: &Path) -> std::io::Result<FileEntry> {
    let body = Bytes::from(std::fs::read(path)?);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let brotli = if NO_COMPRESS_EXTS.contains(&ext.as_str()) {
        None
    } else {
        compress(&body).filter(|c| (c.len() as f64) < body.len() as f64 * COMPRESS_RATIO)
    };

    Ok(FileEntry { body, brotli, content_type: content_type(&ext) })
}

fn compress(body: &[u8]) -> Option<Bytes> {
    let mut out = Vec::new();
    let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 6, 22);
    writer.write_all(body).ok()?;
    drop(writer);
    Some(Bytes::from(out))
}

fn accepts_br(cx: &Exchange) -> bool {
    cx.headers
        .get(http::header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|enc| enc.trim().starts_with("br")))
        .unwrap_or(false)
}

#[async_trait]
impl Handler for FileServer {
    async fn serve(&self, cx: &mut Exchange) -> Result<Flow, EdgeError> {
        let path = cx.path().to_string();
        let hit = self.resolve(&path);

        let (key, entry) = match hit {
            Some(found) => found,
            None => match &self.not_found {
                Some(fallback) => match self.files.get_key_value(fallback.as_str()) {
                    Some((k, v)) => (k.as_str(), v),
                    None => return Ok(Flow::Continue),
                },
                None => return Ok(Flow::Continue),
            },
        };

        let mut resp = Response::new(if hit.is_some() { 200 } else { 404 });
        if let Ok(v) = http::HeaderValue::from_str(entry.content_type) {
            resp.headers.insert(http::header::CONTENT_TYPE, v);
        }

        if self.immutable && key.starts_with("/immutable/") {
            if let Ok(v) = http::HeaderValue::from_str(YEAR_CACHE) {
                resp.headers.insert(http::header::CACHE_CONTROL, v);
            }
        }

        match (&entry.brotli, accepts_br(cx)) {
            (Some(compressed), true) => {
                if let Ok(v) = http::HeaderValue::from_str("br") {
                    resp.headers.insert(http::header::CONTENT_ENCODING, v);
                }
                resp.body = compressed.clone();
            }
            _ => resp.body = entry.body.clone(),
        }

        Ok(cx.respond(resp))
    }

    fn describe(&self) -> String {
        format!("file-server[{} files]", self.files.len())
    }
}

#[cfg(test)]
#[path = "fileserver_tests.rs"]
mod tests;
