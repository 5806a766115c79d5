//! # Observability
//!
//! Logging initialization for binaries embedding the balancer. The crate
//! itself only emits `tracing` events and `metrics` macros; installing a
//! subscriber/recorder is the embedding application's choice, and this helper
//! covers the common case.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::error::{BalancerError, BalancerResult};

/// Output format for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line output
    Text,
    /// Structured JSON, one event per line
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive (overridden by `RUST_LOG` when set)
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Install a global tracing subscriber per the config
///
/// Fails if a subscriber is already installed, which usually means the
/// embedding application set one up itself — in that case just skip this call.
pub fn init_logging(config: &LogConfig) -> BalancerResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(fmt::layer().json())
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(filter)
            .with(fmt::layer())
            .try_init(),
    };

    result.map_err(|err| BalancerError::config(format!("failed to install subscriber: {}", err)))
}
