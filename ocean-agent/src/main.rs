//! Ocean integration agent.
//!
//! Keeps the catalog in step with one upstream API:
//! 1. Resyncs on the configured trigger (interval, webhook, queue or once)
//! 2. Applies live events between resyncs
//!
//! Usage:
//!   ocean-agent --config ocean.yaml
//!   ocean-agent --config ocean.yaml --once

use anyhow::{Context, Result};
use clap::Parser;
use ocean_agent::AgentConfig;
use ocean_sync::EventListenerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ocean-agent")]
#[command(about = "Ocean integration agent")]
struct Args {
    /// Agent configuration file
    #[arg(short, long, default_value = "ocean.yaml")]
    config: PathBuf,

    /// Mapping document, overriding the configured one
    #[arg(short, long)]
    mapping: Option<PathBuf>,

    /// Resync once and exit, whatever listener is configured
    #[arg(long)]
    once: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut config = AgentConfig::from_path(&args.config)?;
    config.apply_env(|name| std::env::var(name).ok());
    if let Some(mapping) = args.mapping {
        config.mapping = mapping;
    }
    if args.once {
        config.sync.event_listener = EventListenerConfig::Once;
    }

    let mapping = config.load_mapping()?;
    let integration = Arc::new(config.build_integration(mapping)?);
    info!(
        integration = %config.integration,
        kinds = integration.mapper().kinds().len(),
        "ocean agent started"
    );

    let signal = Arc::clone(&integration);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal.shutdown();
        }
    });

    if let Some(report) = ocean_agent::run(integration).await? {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to render report")?
        );
        ocean_agent::check_report(&report)?;
    }
    Ok(())
}
