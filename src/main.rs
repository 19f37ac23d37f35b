mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use mnema::config::MnemaConfig;

#[derive(Parser)]
#[command(name = "mnema", version, about = "Maintenance tool for the mnema memory engine")]
struct Cli {
    /// Config file to use instead of ~/.mnema/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show record, graph and index statistics
    Stats {
        /// Restrict counts to one owner
        #[arg(long)]
        owner: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Check database integrity and graph consistency
    Doctor,
    /// Export records and the graph as JSON Lines to stdout
    Export {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Import a JSON Lines file produced by `export`
    Import {
        file: PathBuf,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Rebuild derived indexes from the record store
    Rebuild {
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Delete session records not updated for the given number of days
    Prune {
        #[arg(long)]
        older_than_days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MnemaConfig::load_from(path)?,
        None => MnemaConfig::load()?,
    };

    // Log to stderr so stdout stays clean for `export`.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Stats { owner, json } => cli::stats::stats(config, owner.as_deref(), json).await?,
        Command::Doctor => cli::doctor::doctor(config).await?,
        Command::Export { owner } => cli::export::export(config, owner).await?,
        Command::Import { file, timeout_secs } => cli::import::import(config, &file, timeout_secs).await?,
        Command::Rebuild {
            concurrency,
            timeout_secs,
        } => cli::maintenance::rebuild(config, concurrency, timeout_secs).await?,
        Command::Prune { older_than_days } => cli::maintenance::prune(config, older_than_days).await?,
    }

    Ok(())
}
