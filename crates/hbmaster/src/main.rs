// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbmaster contributors

//! hbmaster server binary.
//!
//! ```bash
//! hbmaster --config config.json
//! hbmaster --config config.json --log-level debug
//! ```
//!
//! Exit codes: 0 normal, 1 configuration error, 2 bind failure.

use clap::Parser;
use hbmaster::{Config, Server, ServerError};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// HomeBrew DMR master server.
#[derive(Parser, Debug)]
#[command(name = "hbmaster")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(config: &Config, override_level: Option<&str>) {
    let level = override_level.unwrap_or(&config.global.log_level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hbmaster={}", level)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &config.global.log_file {
        Some(path) => match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => builder.with_writer(std::sync::Mutex::new(file)).init(),
            Err(e) => {
                builder.init();
                error!(path = %path.display(), "cannot open log file, using stderr: {}", e);
            }
        },
        None => builder.init(),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("configuration error in {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    init_logging(&config, args.log_level.as_deref());
    info!(version = env!("CARGO_PKG_VERSION"), "hbmaster starting");

    let mut server = match Server::new(config).await {
        Ok(server) => server,
        Err(e @ ServerError::Bind(_)) => {
            error!("{}", e);
            std::process::exit(2);
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    // Ctrl-C / SIGTERM triggers the graceful shutdown path.
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            // notify_one stores a permit, so the signal is not lost if the
            // run loop is mid-packet rather than parked on notified().
            shutdown.notify_one();
        }
    });

    if let Err(e) = server.run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}
