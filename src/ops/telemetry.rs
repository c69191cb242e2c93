use crate::core::config::LogLevel;
use anyhow::{Context, Result};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Filter directive for a configured level; unparsable directives fall back to `info`.
fn filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize JSON logging with reloadable level.
pub fn init_tracing(log_level: Option<&str>) -> Result<LogHandle> {
    let (filter_layer, handle) = reload::Layer::new(filter(log_level.unwrap_or("info")));
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}

/// Swap the active filter for `level`.
pub fn set_level(handle: &LogHandle, level: LogLevel) -> Result<()> {
    handle
        .reload(filter(level.directive()))
        .context("failed to reload log filter")?;
    tracing::info!(level = level.directive(), "log level changed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_directive_falls_back_to_info() {
        assert_eq!(filter("gantry=[").to_string(), "info");
        assert_eq!(filter("debug").to_string(), "debug");
    }

    #[test]
    fn reload_handle_accepts_levels() {
        let (layer, handle) = reload::Layer::<_, tracing_subscriber::Registry>::new(filter("info"));
        let _subscriber = tracing_subscriber::registry().with(layer);
        set_level(&handle, LogLevel::Warn).unwrap();
        handle
            .with_current(|current| assert_eq!(current.to_string(), "warn"))
            .unwrap();
    }
}
