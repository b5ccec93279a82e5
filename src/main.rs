//! Conviction Engine - token scoring and automated position supervision
//!
//! # WARNING
//! - Launch tokens are extremely volatile; most go to zero.
//! - Stop-loss and rug exits are best-effort. Fast collapses can gap
//!   through a stop between two telemetry samples.
//! - The bundled gateway is a paper simulator; plug a real venue in behind
//!   `ExecutionGateway` at your own risk.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

use conviction_engine::cli::commands;
use conviction_engine::config::Config;

const DEFAULT_LOG_FILTER: &str = "conviction_engine=info";

/// Conviction Engine - score, enter and supervise launch tokens
#[derive(Parser)]
#[command(name = "conviction")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "CONVICTION_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSONL telemetry file through the engine (paper execution)
    Replay {
        /// Newline-delimited TokenSample JSON
        file: PathBuf,

        /// Pace samples by their timestamps instead of replaying at once
        #[arg(long)]
        paced: bool,
    },

    /// Poll DexScreener for token addresses and paper-trade them
    Watch {
        /// Token addresses (defaults to feed.watch_list)
        addresses: Vec<String>,
    },

    /// Score the final state of each token in a replay file, no trading
    Score {
        file: PathBuf,
    },

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Replay { file, paced } => commands::replay(&config, &file, paced).await,
        Commands::Watch { addresses } => commands::watch(&config, addresses).await,
        Commands::Score { file } => commands::score(&config, &file).await,
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }
}
