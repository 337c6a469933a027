//! tubed - Tube player backend daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tubed::{AppState, Catalog, DEFAULT_BIND};

#[derive(Parser)]
#[command(name = "tubed")]
#[command(about = "State and content backend for the tube player", long_about = None)]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = DEFAULT_BIND)]
    bind: String,

    /// JSON stitch catalog; content is generated when omitted
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("tubed v{} starting", env!("CARGO_PKG_VERSION"));

    let catalog = match &cli.catalog {
        Some(path) => Catalog::load(path)?,
        None => {
            info!("  No catalog given, generating stitch content on demand");
            Catalog::generated()
        }
    };

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", cli.bind))?;

    tokio::select! {
        result = tubed::run(addr, AppState::new(catalog)) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down gracefully"),
    }

    Ok(())
}
