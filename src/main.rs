//! dlquota command-line entry point.
//!
//! Usage:
//!   # Run one instance with the default config
//!   dlquota run
//!
//!   # Run with an explicit config and hot-reload of default limits
//!   dlquota --config ./dlquota.toml run --watch
//!
//!   # Print or check the effective configuration
//!   dlquota config show
//!   dlquota config check
//!
//!   # Three instances, one shared store
//!   dlquota simulate --instances 3 --users 2 --downloads 4 --max-quota 10

mod cli;

use anyhow::Result;
use clap::Parser;

use cli::{cmd_config, cmd_run, cmd_simulate, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run { watch, poll_secs } => cmd_run(config_path, watch, poll_secs).await,
        Commands::Config { action } => cmd_config(action, config_path),
        Commands::Simulate(args) => cmd_simulate(args).await,
    }
}
