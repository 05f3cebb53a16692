//! Prompt Screening Gateway daemon entry point.
//!
//! Loads the environment-driven configuration, assembles the engine with its
//! HTTP back-ends, and serves the gateway API.

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::Parser;
use psg_common::config::WarningSeverity;
use psg_common::{GatewayConfig, validate_config};
use psg_store::RuleStore;
use psgd::engine::{Backends, Engine};
use psgd::http_api;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "psgd")]
#[command(author, version, about = "Prompt Screening Gateway daemon")]
struct Cli {
    /// Listen address (overrides PSG_LISTEN_ADDR)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Rule store path (overrides PSG_DB_PATH)
    #[arg(short, long)]
    db: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, env_report) = GatewayConfig::from_env();
    if let Some(listen) = cli.listen {
        config.listen_addr = listen.to_string();
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    if !env_report.errors.is_empty() {
        for error in &env_report.errors {
            warn!("{}", error);
        }
        bail!(
            "{} configuration error(s); refusing to start",
            env_report.errors.len()
        );
    }
    if !env_report.overrides.is_empty() {
        info!(
            "{} setting(s) taken from the environment: {}",
            env_report.overrides.len(),
            env_report.overrides.join(", ")
        );
    }
    for warning in validate_config(&config) {
        match warning.severity {
            WarningSeverity::Warning => warn!("{}", warning.message),
            WarningSeverity::Info => info!("{}", warning.message),
        }
    }

    info!("Starting Prompt Screening Gateway daemon...");
    let store = RuleStore::open(&config.db_path)
        .with_context(|| format!("failed to open rule store at {:?}", config.db_path))?;
    info!("Rule store ready at {:?}", config.db_path);

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address '{}'", config.listen_addr))?;

    let backends = Backends::from_config(&config);
    let engine = Engine::new(config, store, backends);

    let server = http_api::start_server(addr, engine).await;
    server.await?.context("gateway server failed")?;
    Ok(())
}
