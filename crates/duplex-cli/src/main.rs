//! DUPLEX CLI
//!
//! Inspect the call engine's process-wide capabilities and run loopback
//! call simulations.

mod capture;
mod config;
mod format;
mod simulate;

use clap::{Parser, Subcommand};
use duplex_core::global;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use config::Config;
use simulate::SimulationOptions;

/// DUPLEX - encrypted two-party call engine
#[derive(Parser)]
#[command(name = "duplex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List supported protocol versions
    Versions {
        /// Include reference-implementation versions
        #[arg(long)]
        reference: bool,
    },

    /// Print the highest supported relay layer
    MaxLayer,

    /// Run a caller and a callee against each other in memory
    Simulate {
        /// Make the direct primary unreachable to exercise failover
        #[arg(long)]
        unreachable_primary: bool,

        /// Relay alternatives to offer (overrides the config file)
        #[arg(long)]
        alternatives: Option<usize>,

        /// Start with video
        #[arg(long)]
        video: bool,

        /// Call length in seconds (overrides the config file)
        #[arg(long)]
        duration_secs: Option<u64>,

        /// JSON server config blob applied before the call
        #[arg(long)]
        server_config: Option<PathBuf>,

        /// Echo session debug lines to stderr
        #[arg(long)]
        session_log: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(cli.config.as_deref())?;

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Versions { reference } => {
            for version in global::versions(reference) {
                println!("{version}");
            }
        }
        Commands::MaxLayer => {
            println!("{}", global::max_layer());
        }
        Commands::Simulate {
            unreachable_primary,
            alternatives,
            video,
            duration_secs,
            server_config,
            session_log,
        } => {
            if let Some(alternatives) = alternatives {
                config.simulation.alternatives = alternatives;
            }
            if let Some(duration_secs) = duration_secs {
                config.simulation.duration_secs = duration_secs;
            }
            config.validate()?;

            if let Some(path) = server_config {
                let blob = tokio::fs::read_to_string(&path).await?;
                global::apply_server_config(Some(&blob))?;
                tracing::info!("Applied server config from {}", path.display());
            }

            simulate::run(
                &config,
                SimulationOptions {
                    unreachable_primary,
                    video,
                    print_session_log: session_log,
                },
            )
            .await?;
        }
    }

    Ok(())
}
