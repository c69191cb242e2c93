//! Gantry - unified CLI entrypoint.
//!
//! Usage:
//!   gantry check --config config/gantry.toml
//!   gantry etag encode 0:17 1:4
//!   gantry etag decode <etag>
//!   gantry replay --config config/gantry.toml --capture connect.bin

use anyhow::Result;
use clap::Parser;
use gantry::cli::commands::{run_check, run_etag, run_replay};
use gantry::cli::{Cli, Commands};
use gantry::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_handle = init_tracing(cli.log_level.as_deref())?;
    // --log-level wins over the configured level
    let config_log = cli.log_level.is_none().then_some(&log_handle);

    match cli.command {
        Commands::Check(args) => run_check(args, config_log),
        Commands::Etag(args) => run_etag(args),
        Commands::Replay(args) => run_replay(args, config_log).await,
    }
}
