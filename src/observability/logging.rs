//! # Logging
//!
//! Installs the global `tracing` subscriber.
//!
//! The level comes from `basic.log_level` (already overridable through
//! `GATEHOUSE_LOG_LEVEL`); a `RUST_LOG` directive set in the environment takes precedence
//! over both. Output is human-readable text or one JSON object per line.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::LogFormat;
use crate::core::error::{GatewayError, GatewayResult};

/// Filter from `RUST_LOG` when set, otherwise from `level`
pub fn env_filter(level: &str) -> GatewayResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| GatewayError::config(format!("invalid log level '{}': {}", level, e))),
    }
}

/// Install the subscriber. Fails if one is already installed.
pub fn init_logging(level: &str, format: LogFormat) -> GatewayResult<()> {
    let filter = env_filter(level)?;

    let result = match format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    result.map_err(|e| GatewayError::internal(format!("failed to install log subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_builds_filter() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(env_filter("debug").is_ok());
            assert!(env_filter("gatehouse=trace,hyper=warn").is_ok());
        }
    }

    #[test]
    fn test_malformed_directive_rejected() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(env_filter("gatehouse=chatty").is_err());
        }
    }
}
