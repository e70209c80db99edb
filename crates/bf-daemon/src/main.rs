//! bf-daemon entry point.
//!
//! This file is intentionally thin: it loads env, sets up tracing, parses
//! flags, starts the engine, and waits for a termination signal. All
//! wiring lives in the library's `Engine`.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use bf_config::EngineConfig;
use bf_daemon::{Engine, EngineOptions};

#[derive(Parser, Debug)]
#[command(name = "bf-daemon", about = "Bifrost execution-engine scheduler")]
struct Args {
    /// Path to the worker binary (defaults to bf-worker next to this one).
    #[arg(long)]
    worker_bin: Option<PathBuf>,

    /// Unix socket serving execution context to workers.
    #[arg(long)]
    store_socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file
    // does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let args = Args::parse();
    let mut options = EngineOptions::discover()?;
    if let Some(worker_bin) = args.worker_bin {
        options.worker_bin = worker_bin;
    }
    if let Some(store_socket) = args.store_socket {
        options.store_socket = store_socket;
    }

    let config = EngineConfig::from_env()?;
    let engine = Engine::start(config, options).await?;

    wait_for_termination().await?;
    engine.shutdown().await;
    info!("bye");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn wait_for_termination() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
    Ok(())
}
