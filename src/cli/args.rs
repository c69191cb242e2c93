//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Gantry - sans-io protocol engines for MQTT, gRPC and HTTP-Kafka.
#[derive(Parser)]
#[command(name = "gantry")]
#[command(version)]
#[command(about = "Gantry protocol engines and diagnostic tools")]
pub struct Cli {
    /// Log filter directive, overriding the configured level
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate a configuration file
    Check(CheckArgs),

    /// Encode or decode fetch progress etags
    Etag(EtagArgs),

    /// Feed a captured MQTT byte stream through the server engine
    Replay(ReplayArgs),
}

#[derive(Args)]
pub struct CheckArgs {
    /// Path to configuration file; `GANTRY_CONFIG` or config/gantry.toml when absent
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct EtagArgs {
    #[command(subcommand)]
    pub action: EtagAction,
}

#[derive(Subcommand)]
pub enum EtagAction {
    /// Encode `partition:offset` pairs into an etag
    Encode {
        #[arg(required = true)]
        offsets: Vec<String>,
    },
    /// Decode an etag into `partition:offset` pairs
    Decode { etag: String },
}

#[derive(Args)]
pub struct ReplayArgs {
    /// Path to configuration file supplying MQTT settings and routes
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Raw bytes a client sent on one connection
    #[arg(long)]
    pub capture: PathBuf,

    /// Reply window granted to the engine, in bytes
    #[arg(long, default_value_t = 65536)]
    pub window: u32,
}
