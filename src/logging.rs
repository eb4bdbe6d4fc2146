//! Tracing setup for engine diagnostics.
//!
//! The orchestrator emits one structured `tracing` event per step (fields:
//! `issue`, `stage`, `event`, `next`, `iteration`, `attempt`). Per-stage JSON
//! artifacts are written separately by the kernels and are unaffected by
//! `RUST_LOG`.

use std::str::FromStr;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::errors::ConfigError;

/// Env var read by [`LogFormat::from_env`].
pub const LOG_FORMAT_ENV: &str = "ISSUEFLOW_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::InvalidValue {
                key: LOG_FORMAT_ENV.to_string(),
                message: format!("unknown log format '{}' (expected compact or json)", other),
            }),
        }
    }
}

impl LogFormat {
    /// Format from `ISSUEFLOW_LOG_FORMAT`, compact when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(LOG_FORMAT_ENV) {
            Ok(raw) => raw.parse(),
            Err(_) => Ok(Self::default()),
        }
    }
}

/// Install the global subscriber.
///
/// Reads `RUST_LOG`; defaults to `info`. Output goes to stderr. Returns an
/// error if a global subscriber is already installed.
pub fn init(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Compact => registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .flatten_event(true),
            )
            .try_init()?,
    }
    Ok(())
}
