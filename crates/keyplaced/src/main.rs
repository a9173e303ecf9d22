//! keyplaced — the keyplace placement daemon.
//!
//! Real transports and storage engines plug in through the collaborator
//! traits in `keyplace-cluster`. This binary ships the pieces that need
//! none of them:
//!
//! - `simulate` runs full placement rounds across an in-process cluster
//! - `config` prints the effective `placement.toml`
//!
//! # Usage
//!
//! ```text
//! keyplaced simulate --nodes 4 --keys 2000 --rounds 3
//! keyplaced config --config placement.toml
//! ```

mod simulate;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use keyplace_core::PlacementConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keyplaced", about = "keyplace data placement daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run placement rounds over an in-process loopback cluster.
    Simulate {
        /// Number of cluster members.
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Number of distinct keys in the synthetic workload.
        #[arg(long, default_value = "1000")]
        keys: usize,

        /// Rounds to run.
        #[arg(long, default_value = "3")]
        rounds: u64,

        /// Top-K capacity of each node's statistics engine.
        #[arg(long, default_value = "64")]
        capacity: usize,

        /// Path to placement.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML.
    Config {
        /// Path to placement.toml. Defaults are printed when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Simulate {
            nodes,
            keys,
            rounds,
            capacity,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            let report = simulate::run(simulate::SimulateArgs {
                nodes,
                keys,
                rounds,
                capacity,
                config,
            })
            .await?;
            info!(
                migrations = report.migrations,
                before = report.misplaced_before,
                after = report.misplaced_after,
                "simulation finished"
            );
            Ok(())
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,keyplaced=debug,keyplace=debug"));
    // Logs go to stderr; stdout carries the command's own output.
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PlacementConfig> {
    match path {
        Some(path) => {
            let config = PlacementConfig::from_file(path)?;
            info!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        None => Ok(PlacementConfig::default()),
    }
}
