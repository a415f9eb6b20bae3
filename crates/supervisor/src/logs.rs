// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rotating per-service logs.
//!
//! `<logs>/<service>.log`, rotated at 16 MB into timestamped siblings;
//! rotated files older than the retention window are pruned.

use chrono::Utc;
use parking_lot::Mutex;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

pub const MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;
pub const RETENTION: Duration = Duration::from_secs(28 * 24 * 60 * 60);

struct Inner {
    file: std::fs::File,
    written: u64,
}

/// Append-only size-rotated log for one service.
pub struct ServiceLog {
    dir: PathBuf,
    name: String,
    inner: Mutex<Option<Inner>>,
    max_size: u64,
}

impl ServiceLog {
    pub fn open(dir: impl Into<PathBuf>, name: impl Into<String>) -> std::io::Result<Self> {
        let log = Self {
            dir: dir.into(),
            name: name.into(),
            inner: Mutex::new(None),
            max_size: MAX_FILE_SIZE,
        };
        std::fs::create_dir_all(&log.dir)?;
        Ok(log)
    }

    #[cfg(test)]
    fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.name))
    }

    /// Append one chunk, rotating first if the file would overflow.
    pub fn append(&self, chunk: &[u8]) -> std::io::Result<()> {
        let mut guard = self.inner.lock();
        if guard.is_none() {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path())?;
            let written = file.metadata()?.len();
            *guard = Some(Inner { file, written });
        }
        // Unwrap-free: just initialized above.
        if let Some(inner) = guard.as_mut() {
            if inner.written + chunk.len() as u64 > self.max_size {
                drop(guard.take());
                self.rotate()?;
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.path())?;
                *guard = Some(Inner { file, written: 0 });
            }
        }
        if let Some(inner) = guard.as_mut() {
            inner.file.write_all(chunk)?;
            inner.written += chunk.len() as u64;
        }
        Ok(())
    }

    pub fn append_line(&self, line: &str) -> std::io::Result<()> {
        let stamped = format!("{} {line}\n", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"));
        self.append(stamped.as_bytes())
    }

    fn rotate(&self) -> std::io::Result<()> {
        let current = self.path();
        if current.exists() {
            let stamp = Utc::now().format("%Y%m%d-%H%M%S%3f");
            let rotated = self.dir.join(format!("{}-{stamp}.log", self.name));
            std::fs::rename(&current, rotated)?;
        }
        self.prune()?;
        Ok(())
    }

    /// Remove rotated files past the retention window.
    pub fn prune(&self) -> std::io::Result<()> {
        let cutoff = std::time::SystemTime::now() - RETENTION;
        let prefix = format!("{}-", self.name);
        for entry in std::fs::read_dir(&self.dir)?.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) || !name.ends_with(".log") {
                continue;
            }
            let modified = entry.metadata().and_then(|m| m.modified());
            if matches!(modified, Ok(m) if m < cutoff) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    /// Last `n` lines of the current file, for the tail RPC.
    pub fn tail(&self, n: usize) -> std::io::Result<Vec<String>> {
        let text = match std::fs::read_to_string(self.path()) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].iter().map(|s| s.to_string()).collect())
    }
}

/// Pump an async reader (child stdout/stderr) into the log.
pub fn pump<R>(log: std::sync::Arc<ServiceLog>, reader: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::AsyncBufReadExt;
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Err(err) = log.append_line(&line) {
                tracing::warn!(%err, "service log write failed");
                return;
            }
        }
    });
}
