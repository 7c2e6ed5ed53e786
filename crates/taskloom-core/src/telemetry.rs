//! Tracing bootstrap for binaries and long-running services.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;
use crate::error::TaskloomError;

static TELEMETRY_GUARD: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    /// Explicit filter directive; falls back to `RUST_LOG`, then "info".
    pub env_filter: Option<String>,
    pub with_ansi: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            env_filter: None,
            with_ansi: true,
        }
    }
}

impl TelemetryOptions {
    /// Derive options from the logging section of the loaded config.
    pub fn from_logging(config: &LoggingConfig) -> Self {
        Self {
            env_filter: Some(config.level.clone()),
            with_ansi: true,
        }
    }
}

/// Install the global tracing subscriber. Idempotent: only the first call
/// installs; later calls are no-ops so tests and embedded uses can call it
/// freely.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), TaskloomError> {
    if TELEMETRY_GUARD.get().is_some() {
        return Ok(());
    }

    let directive = options
        .env_filter
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());

    fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(directive))
        .with_ansi(options.with_ansi)
        .try_init()
        .map_err(|err| {
            TaskloomError::InvalidConfiguration(format!("telemetry init failed: {err}"))
        })?;

    TELEMETRY_GUARD.get_or_init(|| ());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_safe() {
        let options = TelemetryOptions {
            env_filter: Some("warn".to_string()),
            with_ansi: false,
        };
        // Whatever the first call returned, the second must be a no-op Ok.
        let _ = init_telemetry(options.clone());
        assert!(init_telemetry(options).is_ok());
    }
}
