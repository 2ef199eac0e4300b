//! Logging setup for binaries and tests embedding the client.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the caller.

use std::env;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(String),

    #[error("failed to install subscriber: {0}")]
    Install(String),
}

/// Log output configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive (trace, debug, info, warn, error or a full EnvFilter)
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_logs: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl LogConfig {
    /// Create configuration from environment variables.
    ///
    /// - `QC_LOG_LEVEL` or `RUST_LOG`: filter (default: info)
    /// - `QC_JSON_LOGS`: JSON output (default: false)
    pub fn from_env() -> Self {
        Self {
            log_level: env::var("QC_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),
            json_logs: env::var("QC_JSON_LOGS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}

/// Install a global `tracing` subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_tracing(config: &LogConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_new(&config.log_level)
        .map_err(|e| TelemetryError::Filter(e.to_string()))?;

    if config.json_logs {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .try_init()
            .map_err(|e| TelemetryError::Install(e.to_string()))?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(true);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TelemetryError::Install(e.to_string()))?;
    }

    tracing::info!(
        log_level = %config.log_level,
        json = config.json_logs,
        "Tracing initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = LogConfig {
            log_level: "my_crate=notalevel".to_string(),
            json_logs: false,
        };
        assert!(matches!(
            init_tracing(&config),
            Err(TelemetryError::Filter(_))
        ));
    }
}
