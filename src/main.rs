/*
 * This file is part of Casterd.
 *
 * Copyright (C) 2026 Casterd contributors
 *
 * Casterd is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Casterd is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Casterd. If not, see <https://www.gnu.org/licenses/>.
 */

//! casterd - the daemon entry point.
//!
//! Runs as root on the machine driving the caster hardware: verifies
//! privileges, writes a PID file, brings up journald-or-stdout logging,
//! instantiates every configured interface and serves the HTTP API until
//! SIGINT/SIGTERM, then de-energizes everything on the way out.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use casterd::{config, daemon, interface::InterfaceManager, server};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    eprintln!("casterd {VERSION} - Monotype caster control daemon");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    casterd [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH   Configuration file (default {})", config::DEFAULT_CONFIG_PATH);
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    CASTERD_LOG         Log level (trace, debug, info, warn, error)");
}

fn pid_file_path() -> &'static str {
    if Path::new("/run").exists() {
        "/run/casterd.pid"
    } else {
        "/var/run/casterd.pid"
    }
}

/// Write the PID file, refusing to start when another live instance
/// holds it.
fn write_pid_file() -> std::io::Result<()> {
    use std::io::Write;

    let path = pid_file_path();
    if Path::new(path).exists() {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(old_pid) = content.trim().parse::<i32>() {
                // SAFETY: kill with signal 0 only checks for existence.
                if unsafe { libc::kill(old_pid, 0) } == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        format!("another instance is running (PID {old_pid})"),
                    ));
                }
            }
        }
        // stale PID file
        let _ = std::fs::remove_file(path);
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

fn cleanup() {
    let path = pid_file_path();
    if Path::new(path).exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("failed to remove PID file: {e}");
        }
    }
}

fn init_logging() {
    let log_level = std::env::var("CASTERD_LOG").unwrap_or_else(|_| "info".to_string());

    // Prefer journald on systemd machines, stdout otherwise.
    if Path::new("/run/systemd/journal/socket").exists() {
        if let Ok(journald) = tracing_journald::layer() {
            use tracing_subscriber::prelude::*;
            tracing_subscriber::registry()
                .with(journald)
                .with(tracing_subscriber::EnvFilter::new(&log_level))
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(&log_level)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from(config::DEFAULT_CONFIG_PATH);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("casterd {VERSION}");
                return Ok(());
            }
            "-c" | "--config" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
                config_path = PathBuf::from(&args[i]);
            }
            arg => {
                eprintln!("Unknown argument: {arg}");
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    init_logging();
    info!("STARTUP: casterd {VERSION}");

    // SAFETY: geteuid just returns the effective user id.
    if unsafe { libc::geteuid() } != 0 {
        error!("casterd must run as root for GPIO and i2c access");
        std::process::exit(1);
    }
    // SAFETY: umask only sets the file creation mask.
    unsafe { libc::umask(0o077) };

    if let Err(e) = write_pid_file() {
        error!("could not write PID file: {e}");
        std::process::exit(1);
    }

    let result = run(&config_path).await;
    cleanup();
    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    let cfg = config::load(config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    info!(
        "STARTUP: {} interface(s) configured, listening on {}",
        cfg.interfaces.len(),
        cfg.listen_address
    );

    let manager = Arc::new(InterfaceManager::from_config(&cfg).context("interface setup")?);
    let running = Arc::new(AtomicBool::new(true));
    let supervisor = daemon::spawn(&cfg, manager.clone(), running.clone())
        .context("supervisor setup")?;

    // SIGINT/SIGTERM initiate a graceful shutdown of the HTTP server;
    // teardown below de-energizes the hardware.
    let shutdown = Arc::new(tokio::sync::Notify::new());
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("SIGNAL: shutdown requested");
            shutdown.notify_one();
        })
        .context("installing signal handler")?;
    }

    let listener = tokio::net::TcpListener::bind(cfg.listen_address)
        .await
        .with_context(|| format!("binding {}", cfg.listen_address))?;
    let app = server::router(manager.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.notified().await }
        })
        .await
        .context("http server")?;

    info!("SHUTDOWN: stopping interfaces");
    running.store(false, std::sync::atomic::Ordering::SeqCst);
    manager.shutdown();
    if supervisor.join().is_err() {
        warn!("supervisor thread panicked");
    }
    info!("SHUTDOWN: complete");
    Ok(())
}
