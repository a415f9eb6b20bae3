// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node directory layout.
//!
//! Everything lives under one config directory (default
//! `~/.config/pm3`, overridable with `PM3_HOME`): logs, certs, asn
//! caches, broker data, the process tracker, and the lock file.

use std::path::PathBuf;

pub fn config_dir() -> Option<PathBuf> {
    if let Ok(home) = std::env::var("PM3_HOME") {
        return Some(PathBuf::from(home));
    }
    dirs::config_dir().map(|base| base.join("pm3"))
}

/// Fixed subdirectories of the config dir.
#[derive(Debug, Clone)]
pub struct Dirs {
    pub config: PathBuf,
    pub logs: PathBuf,
    pub certs: PathBuf,
    pub asn: PathBuf,
    pub nats: PathBuf,
}

impl Dirs {
    pub fn under(config: PathBuf) -> Self {
        Self {
            logs: config.join("logs"),
            certs: config.join("certs"),
            asn: config.join("asn"),
            nats: config.join("nats"),
            config,
        }
    }

    pub fn create_all(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.logs, &self.certs, &self.asn, &self.nats] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.config.join("daemon.lock")
    }

    pub fn secret_path(&self) -> PathBuf {
        self.config.join("secret.key")
    }

    pub fn tracker_path(&self) -> PathBuf {
        self.config.join("proc.tracker")
    }

    pub fn daemon_log_path(&self) -> PathBuf {
        self.logs.join("pm3d.log")
    }
}
