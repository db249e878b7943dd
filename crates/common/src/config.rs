//! Common configuration types for Switchyard components.

use crate::error::SwitchyardError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(SwitchyardError::Configuration(format!(
                "unknown log format: {other}"
            ))),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub log_filter: String,
    /// Log line format
    pub log_format: LogFormat,
}

impl ObservabilityConfig {
    /// Load from a variable map, using `default_filter` when none is given.
    ///
    /// Reads `RC_LOG_FORMAT` (`text` or `json`).
    pub fn from_vars(
        vars: &HashMap<String, String>,
        default_filter: &str,
    ) -> Result<Self, SwitchyardError> {
        let log_format = match vars.get("RC_LOG_FORMAT") {
            Some(value) => value.parse()?,
            None => LogFormat::default(),
        };

        Ok(Self {
            log_filter: default_filter.to_string(),
            log_format,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_observability_defaults() {
        let config = ObservabilityConfig::from_vars(&HashMap::new(), "info").unwrap();
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.log_filter, "info");
    }
}
