//! waygate daemon entry point.
//!
//! Parses flags, loads config, installs the tracing subscriber, and hands
//! off to the gateway. Flags override config; config overrides defaults.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use waygate::config::Config;
use waygate::gateway;

#[derive(Parser, Debug)]
#[command(name = "waygate")]
#[command(version, about = "Multi-tenant messaging-session gateway", long_about = None)]
struct Args {
    /// Bind host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Path to config.toml (default: the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise default to info.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(args.config.as_deref())?;
    let host = args
        .host
        .clone()
        .unwrap_or_else(|| config.gateway.host.clone());
    let port = args.port.unwrap_or(config.gateway.port);

    gateway::run_gateway(&host, port, config).await
}
