//! Command-line interface.

mod config;
mod run;
mod simulate;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use dlquota::Config;

pub(crate) use config::cmd_config;
pub(crate) use run::cmd_run;
pub(crate) use simulate::cmd_simulate;

#[derive(Parser)]
#[command(name = "dlquota")]
#[command(version)]
#[command(about = "Distributed download quota and rate-limit engine")]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.dlquota/config.toml)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run an engine instance until Ctrl+C
    Run {
        /// Reload default limits when the config file changes
        #[arg(long)]
        watch: bool,
        /// Config poll interval in seconds
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,
    },
    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Drive several in-process instances against one shared store
    Simulate(SimulateArgs),
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the configuration and exit
    Check,
}

#[derive(clap::Args, Debug, Clone)]
pub(crate) struct SimulateArgs {
    /// Number of engine instances sharing the store
    #[arg(long, default_value_t = 2)]
    pub instances: usize,
    /// Users per instance
    #[arg(long, default_value_t = 3)]
    pub users: usize,
    /// Download attempts per user per instance
    #[arg(long, default_value_t = 5)]
    pub downloads: usize,
    /// Maximum downloads per user (-1 for unlimited)
    #[arg(long, default_value_t = 8)]
    pub max_quota: i64,
    /// Maximum concurrent downloads per user (-1 for unlimited)
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub rate_limit: i64,
    /// Tenant the simulated users belong to
    #[arg(long, default_value = "demo")]
    pub tenant: String,
    /// Skip reconciliation between instance turns
    #[arg(long)]
    pub isolated: bool,
}

/// Effective configuration: the given file, or the default location.
pub(crate) fn load_config(path: Option<&Path>) -> Result<Config> {
    let _ = dotenvy::dotenv();
    match path {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load().context("failed to load config"),
    }
}
