//! beacond — the Beacon daemon.
//!
//! Runs the state store as a single-node cluster:
//! - State store (redb)
//! - Command intake (newline-delimited JSON on stdin)
//! - Tombstone GC and session TTL reapers
//!
//! # Usage
//!
//! ```text
//! beacond standalone --config /etc/beacon/beacon.toml
//! beacond dump --config /etc/beacon/beacon.toml > snapshot.jsonl
//! ```

mod config;
mod standalone;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::BeaconConfig;

#[derive(Parser)]
#[command(name = "beacond", about = "Beacon service-discovery daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (single node, commands on stdin).
    Standalone {
        /// Path to beacon.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Write a snapshot of the store to stdout.
    Dump {
        /// Path to beacon.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn load_config(path: Option<PathBuf>, data_dir: Option<PathBuf>) -> anyhow::Result<BeaconConfig> {
    let mut config = match path {
        Some(path) => BeaconConfig::from_file(&path)?,
        None => BeaconConfig::default(),
    };
    if let Some(data_dir) = data_dir {
        config.data_dir = data_dir;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries responses and snapshots.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,beacond=debug,beacon=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone { config, data_dir } => {
            standalone::run_standalone(load_config(config, data_dir)?).await
        }
        Command::Dump { config, data_dir } => standalone::run_dump(load_config(config, data_dir)?),
    }
}
