//! Configuration validation.

use super::load_config;
use crate::cli::args::CheckArgs;
use crate::core::config::GatewayConfig;
use crate::ops::telemetry::LogHandle;
use anyhow::Result;

pub fn run_check(args: CheckArgs, log: Option<&LogHandle>) -> Result<()> {
    let config = load_config(args.config.as_deref(), log)?;
    println!("{}", summary(&config));
    Ok(())
}

fn summary(config: &GatewayConfig) -> String {
    format!(
        "config ok: log_level={} mqtt.routes={} grpc.routes={} http_kafka.routes={}",
        config.telemetry.log_level.as_deref().unwrap_or("info"),
        config.mqtt.routes.len(),
        config.grpc.routes.len(),
        config.http_kafka.routes.len(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn check_accepts_valid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[[grpc.routes]]\nid = 1\nservice = \"example.EchoService\"\n"
        )
        .unwrap();
        let args = CheckArgs {
            config: Some(file.path().to_path_buf()),
        };
        run_check(args, None).unwrap();
    }

    #[test]
    fn check_rejects_invalid_routes() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[mqtt]\nmaximum_qos = 2\n").unwrap();
        let args = CheckArgs {
            config: Some(file.path().to_path_buf()),
        };
        let err = run_check(args, None).unwrap_err();
        assert!(format!("{err:#}").contains("maximum_qos"));
    }

    #[test]
    fn summary_counts_routes() {
        let config = GatewayConfig::default();
        assert_eq!(
            summary(&config),
            "config ok: log_level=info mqtt.routes=0 grpc.routes=0 http_kafka.routes=0"
        );
    }
}
