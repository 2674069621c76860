//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::estimator::EstimatorKind;
use crate::settings::Settings;

/// Arcade agent CLI
#[derive(Parser, Debug)]
#[command(name = "arcade-agent")]
#[command(about = "Self-training Q-learning agent for a WebSocket arcade game")]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to ./arcade_agent.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to the game and learn until interrupted
    Run {
        /// Game server WebSocket URL
        #[arg(long)]
        url: Option<String>,
        /// Value estimator to train
        #[arg(long, value_enum)]
        estimator: Option<EstimatorKind>,
    },
    /// Print a summary of the configured checkpoint
    Inspect {
        #[arg(long, value_enum)]
        estimator: Option<EstimatorKind>,
    },
    /// Print the effective settings as TOML
    Config,
}

impl Commands {
    /// Fold command-line overrides into `settings`.
    pub fn apply_overrides(&self, settings: &mut Settings) {
        match self {
            Commands::Run { url, estimator } => {
                if let Some(url) = url {
                    settings.connection.url = url.clone();
                }
                if let Some(estimator) = estimator {
                    settings.learning.estimator = *estimator;
                }
            }
            Commands::Inspect { estimator } => {
                if let Some(estimator) = estimator {
                    settings.learning.estimator = *estimator;
                }
            }
            Commands::Config => {}
        }
    }
}
