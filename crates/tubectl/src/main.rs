//! tubectl - practice the tube rotation from the terminal

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tube_common::{AnonymousPolicy, PracticeSession, TubeConfig};
use tubectl::commands;

#[derive(Parser)]
#[command(name = "tubectl")]
#[command(about = "Tube player - adaptive practice rotation", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the standard search path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Learner id; recovered from the device or credentials when omitted
    #[arg(long, global = true)]
    user: Option<String>,

    /// Mint an anonymous id when no identity can be recovered
    #[arg(long, global = true)]
    allow_anonymous: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show rotation and sync status
    Status,

    /// Record a finished unit
    Complete {
        /// Tube number (defaults to the active tube)
        #[arg(long)]
        slot: Option<u8>,

        /// Questions answered correctly
        #[arg(long)]
        correct: u32,

        /// Questions in the unit
        #[arg(long)]
        total: u32,
    },

    /// Move to another tube
    Rotate {
        /// Tube to switch to (defaults to the next one)
        #[arg(long)]
        to: Option<u8>,
    },

    /// Save locally and push to the backend now
    Sync,

    /// Print the rotation view
    View {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Content cache status
    Cache {
        /// Prefetch upcoming stitches for every tube first
        #[arg(long)]
        prefetch: bool,
    },

    /// Print the ready stitch's questions
    Show {
        #[arg(long)]
        slot: Option<u8>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = TubeConfig::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let policy = AnonymousPolicy::from_allow(cli.allow_anonymous || config.identity.allow_anonymous);
    let session = PracticeSession::start(config, cli.user.as_deref(), policy).await?;

    let result = match cli.command {
        Commands::Status => commands::status(&session),
        Commands::Complete { slot, correct, total } => commands::complete(&session, slot, correct, total),
        Commands::Rotate { to } => commands::rotate(&session, to),
        Commands::Sync => commands::sync(&session).await,
        Commands::View { json } => commands::view(&session, json),
        Commands::Cache { prefetch } => commands::cache(&session, prefetch).await,
        Commands::Show { slot } => commands::show(&session, slot).await,
    };

    if let Some(flush) = session.shutdown() {
        if let Err(e) = flush.await {
            debug!("Unload flush task failed: {}", e);
        }
    }
    result
}
