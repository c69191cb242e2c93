//! Gantry CLI.
//!
//! - `gantry check` - Validate a configuration file
//! - `gantry etag` - Encode and decode fetch progress etags
//! - `gantry replay` - Replay an MQTT capture through the server engine

mod args;
pub mod commands;

pub use args::{CheckArgs, Cli, Commands, EtagAction, EtagArgs, ReplayArgs};
