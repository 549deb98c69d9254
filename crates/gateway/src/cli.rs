//! Command-line interface for the daemon.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use ps_domain::config::Config;

#[derive(Parser)]
#[command(name = "podscope", about = "AI-assisted Kubernetes investigation daemon")]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "podscope.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon (default).
    Serve,
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version and exit.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file and report issues.
    Validate,
}

/// Load the config file. A missing file is not an error: the daemon runs on
/// defaults until one is written.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("cannot parse config file {}", path.display()))
}
