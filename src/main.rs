//! Tradewarden server - headless trading control plane.
//!
//! Runs the full pipeline (market data -> agents -> risk gateway ->
//! execution) plus the administrative HTTP/WS surface. No GUI; logs go to
//! stdout via tracing.
//!
//! # Exit codes
//! - 0: normal shutdown
//! - 1: configuration or validation error
//! - 2: fatal persistence/safety-rail failure
//! - 130: interrupted

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tradewarden::application::system::Runtime;
use tradewarden::config::Config;
use tradewarden::interfaces::api;
use tracing::{error, info, Level};
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "tradewarden", about = "Autonomous crypto-derivatives trading control plane")]
struct Cli {
    /// Path to a TOML configuration file (overrides TRADEWARDEN_CONFIG).
    #[arg(long)]
    config: Option<String>,

    /// Start with trading paused; the admin surface can resume it.
    #[arg(long)]
    paused: bool,
}

fn init_tracing() {
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    if let Some(path) = &cli.config {
        std::env::set_var("TRADEWARDEN_CONFIG", path);
    }

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("tradewarden: {:#}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32> {
    info!("tradewarden {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!(
        "Configuration loaded: mode={:?}, symbols={:?}",
        config.mode, config.symbols
    );

    let (runtime, journal_handle) = Runtime::build(config).await?;
    if cli.paused {
        runtime.pause_trading();
    }

    let handles = runtime.start().await?;

    let api_runtime = Arc::clone(&runtime);
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(api_runtime).await {
            error!("Admin API failed: {}", e);
        }
    });

    info!("tradewarden running. Press Ctrl+C to shut down.");

    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down...");
            runtime.shutdown(handles).await;
            130
        }
        journal = journal_handle => {
            // The journal subscriber only ends early when a safety-relevant
            // event could not be persisted. Fail closed.
            match journal {
                Ok(Err(e)) => {
                    error!("FATAL: safety event journal failed: {:#}", e);
                    2
                }
                Ok(Ok(())) | Err(_) => {
                    error!("FATAL: safety event journal stopped unexpectedly");
                    2
                }
            }
        }
    };

    api_handle.abort();
    Ok(exit_code)
}
