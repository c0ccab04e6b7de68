//! gangplank CLI
//!
//! Command-line interface for running admission cycles over a cluster snapshot.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// gangplank - queue-fair gang scheduler with topology-aware device allocation
#[derive(Parser, Debug)]
#[command(name = "gangplank")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run scheduling cycles over a snapshot
    Run {
        /// Cluster snapshot (TOML)
        #[arg(long)]
        snapshot: PathBuf,

        /// Scheduler configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of cycles to run
        #[arg(long, default_value_t = 1)]
        cycles: u32,

        /// Print the reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show queues and their dequeue strategies
    Queues {
        /// Cluster snapshot (TOML)
        #[arg(long)]
        snapshot: PathBuf,
    },

    /// Check every job without scheduling anything
    Validate {
        /// Cluster snapshot (TOML)
        #[arg(long)]
        snapshot: PathBuf,

        /// Scheduler configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Run { config, .. } | Commands::Validate { config, .. } => config.clone(),
        Commands::Queues { .. } => None,
    };
    let config = commands::load_config(config_path.as_deref())?;

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::from_str(&config.logging.level).unwrap_or(Level::WARN)
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match cli.command {
        Commands::Run {
            snapshot,
            cycles,
            json,
            ..
        } => {
            commands::run(&snapshot, &config, cycles, json).await?;
        }
        Commands::Queues { snapshot } => {
            commands::queues(&snapshot, &config).await?;
        }
        Commands::Validate { snapshot, .. } => {
            commands::validate(&snapshot, &config)?;
        }
    }

    Ok(())
}
