//! Main entry point for the arcade agent CLI.

use anyhow::Result;
use arcade_agent::{
    cli::{self, Commands},
    runner,
    settings::Settings,
    telemetry,
};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load settings, then apply command-line overrides
    let mut settings = Settings::load(args.config.as_deref())?;
    args.command.apply_overrides(&mut settings);
    settings.validate()?;

    // Initialize logging
    telemetry::init(&settings.logging)?;

    // Execute the requested command
    match args.command {
        Commands::Run { .. } => {
            runner::run(&settings, runner::wait_for_shutdown()).await?;
            Ok(())
        }
        Commands::Inspect { .. } => {
            print!("{}", runner::inspect(&settings)?);
            Ok(())
        }
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}
