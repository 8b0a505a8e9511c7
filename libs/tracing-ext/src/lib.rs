//! Logging setup shared by Flowline binaries, demos and tests
//!
//! Components log through `tracing` macros only; the subscriber is chosen
//! once per process with [`init_tracing`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human friendly
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// `EnvFilter` directives, e.g. `info,flowline_consensus=debug`
    ///
    /// `RUST_LOG` takes precedence when set.
    pub filter: String,
    pub format: LogFormat,
    /// Include source file and line
    pub include_location: bool,
    pub include_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Compact,
            include_location: false,
            include_target: true,
        }
    }
}

impl TracingConfig {
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber
///
/// Fails if a global subscriber was already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(config.env_filter());
    match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_target(config.include_target)
                    .flatten_event(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_target(config.include_target),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_target(config.include_target),
            )
            .try_init(),
    }
    .context("Failed to initialize tracing subscriber")
}

/// Route logs to the test harness; repeated calls are ignored
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().compact().with_test_writer())
        .try_init();
}

/// Span carrying the partition and node every log line of a partition is tagged with
pub fn partition_span(partition_id: u32, node_id: u64) -> Span {
    tracing::info_span!("partition", id = partition_id, node = node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json() {
        let config: TracingConfig =
            serde_json::from_str(r#"{ "filter": "debug", "format": "json" }"#).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.filter, "debug");
        assert!(config.include_target);
    }

    #[test]
    fn test_second_init_fails() {
        init_test_tracing();
        assert!(init_tracing(&TracingConfig::default()).is_err());
    }
}
