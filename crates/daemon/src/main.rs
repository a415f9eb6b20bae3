// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! pm3 daemon (pm3d)
//!
//! One process per machine: supervises the manifest's services, fronts
//! them with the virtual-host proxy, and federates over the broker.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod directory;
mod env;
mod rpc;
mod session;

use crate::env::Dirs;
use crate::session::{DaemonSession, SessionError};
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

fn usage() {
    println!("pm3d {}", env!("CARGO_PKG_VERSION"));
    println!("pm3 process-mesh daemon");
    println!();
    println!("USAGE:");
    println!("    pm3d [manifest.yaml]");
    println!();
    println!("The daemon is typically started by the `pm3` CLI and controlled");
    println!("over the RPC host; it reconciles itself to the manifest and");
    println!("keeps reconciling through reloads.");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print help information");
    println!("    -v, --version    Print version information");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut manifest_path = PathBuf::from("pm3.yaml");
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" | "-v" => {
                println!("pm3d {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                usage();
                return Ok(());
            }
            flag if flag.starts_with('-') => {
                eprintln!("error: unexpected argument '{flag}'");
                eprintln!("Usage: pm3d [manifest.yaml]");
                std::process::exit(1);
            }
            path => manifest_path = PathBuf::from(path),
        }
    }

    let Some(config) = env::config_dir() else {
        eprintln!("error: could not determine the config directory");
        std::process::exit(1);
    };
    let dirs = Dirs::under(config);
    dirs.create_all()?;

    let _log_guard = setup_logging(&dirs)?;
    info!(manifest = %manifest_path.display(), "starting pm3d");

    let session = match DaemonSession::open(dirs, manifest_path).await {
        Ok(session) => session,
        Err(SessionError::AlreadyRunning(_)) => {
            eprintln!("pm3d is already running");
            std::process::exit(1);
        }
        Err(err) => {
            error!(%err, "failed to start");
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };
    session.run();
    println!("READY");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("interrupt received"),
        _ = sigterm.recv() => info!("terminate received"),
        _ = session.shutdown_requested.cancelled() => info!("shutdown requested over rpc"),
    }

    session.shutdown().await;
    Ok(())
}

/// File logging with env-filter; the guard must outlive main.
fn setup_logging(
    dirs: &Dirs,
) -> Result<tracing_appender::non_blocking::WorkerGuard, Box<dyn std::error::Error>> {
    let appender = tracing_appender::rolling::never(
        dirs.daemon_log_path()
            .parent()
            .unwrap_or(&dirs.logs)
            .to_path_buf(),
        "pm3d.log",
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(guard)
}
