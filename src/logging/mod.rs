//! Structured logging for the alignment engine.
//!
//! Console output plus an optional daily-rolling JSON file, both behind an
//! `EnvFilter` so deployments can retarget verbosity without a rebuild.

pub mod config;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub use config::LoggingConfig;

/// Initialize the logging system. The returned guard must stay alive for
/// the duration of the process when file logging is enabled, or buffered
/// records are lost on exit.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match config.global_level.as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            "error" => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME").replace('-', "_"), level))
    });

    let mut layers = Vec::new();
    let mut guard = None;

    // Console output layer
    if config.console_output {
        let console_layer = fmt::layer()
            .with_target(true)
            .with_file(config.include_file_location)
            .with_line_number(config.include_file_location);
        layers.push(console_layer.boxed());
    }

    // File output layer
    if let Some(ref log_dir) = config.log_directory {
        let file_appender = tracing_appender::rolling::daily(log_dir, "alignment.log");
        let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(worker_guard);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false).json();
        layers.push(file_layer.boxed());
    }

    tracing_subscriber::registry().with(env_filter).with(layers).init();

    tracing::info!("logging initialized with config: {:?}", config);
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_info_level() {
        let config = LoggingConfig::default();
        assert_eq!(config.global_level, "info");
        assert!(config.console_output);
        assert!(config.log_directory.is_none());
    }

    #[test]
    fn development_config_is_verbose() {
        let config = LoggingConfig::development();
        assert_eq!(config.global_level, "debug");
        assert!(config.include_file_location);
    }
}
