//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Filter priority:
//! 1. `DECKFLOW_LOG` (an `EnvFilter` directive such as `deckflow=debug`)
//! 2. `RUST_LOG`
//! 3. the caller's fallback level

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directive.
pub const LOG_ENV: &str = "DECKFLOW_LOG";

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Reads `DECKFLOW_LOG_FORMAT`; anything but `json` is pretty.
    #[must_use]
    pub fn from_env() -> Self {
        Self::parse(std::env::var("DECKFLOW_LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Builds the filter from the environment, falling back to `fallback`.
#[must_use]
pub fn env_filter(fallback: &str) -> EnvFilter {
    filter_from(std::env::var(LOG_ENV).ok().as_deref(), fallback)
}

fn filter_from(directive: Option<&str>, fallback: &str) -> EnvFilter {
    directive
        .and_then(|d| EnvFilter::try_new(d).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .or_else(|| EnvFilter::try_new(fallback).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Installs the global subscriber.
///
/// Returns `false` if a subscriber was already installed, which makes
/// repeated calls from tests harmless.
pub fn init_logging(format: LogFormat, fallback: &str) -> bool {
    let filter = env_filter(fallback);
    let installed = match format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init(),
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!(LogFormat::parse(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some(" JSON ")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("text")), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(None), LogFormat::Pretty);
    }

    #[test]
    fn test_filter_uses_directive() {
        let filter = filter_from(Some("deckflow=debug"), "warn");
        assert_eq!(filter.to_string(), "deckflow=debug");
    }

    #[test]
    fn test_second_init_is_rejected() {
        let _ = init_logging(LogFormat::Pretty, "warn");
        assert!(!init_logging(LogFormat::Json, "warn"));
    }
}
