//! CLI command implementations.

mod check;
mod etag;
mod replay;

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::config::GatewayConfig;
use crate::ops::telemetry::{set_level, LogHandle};

pub use check::run_check;
pub use etag::run_etag;
pub use replay::run_replay;

/// Load and validate the configuration a command runs against.
///
/// Without `path` the file comes from `GANTRY_CONFIG`. When `log` is set the
/// configured telemetry level replaces the startup filter.
fn load_config(path: Option<&Path>, log: Option<&LogHandle>) -> Result<GatewayConfig> {
    let config = match path {
        Some(path) => GatewayConfig::load_with_overrides(path)?,
        None => GatewayConfig::load_from_env()?,
    };
    let source = path.map_or_else(|| "from GANTRY_CONFIG".to_string(), |p| p.display().to_string());
    config
        .validate()
        .with_context(|| format!("invalid config {source}"))?;
    if let Some(handle) = log {
        set_level(handle, config.log_level()?)?;
    }
    Ok(config)
}
