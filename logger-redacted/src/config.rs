// Logger configuration
use serde::{Deserialize, Serialize};

/// Output format for the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, one event per line
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Default filter directive, overridden by `RUST_LOG` when set
    pub log_level: String,
    pub format: LogFormat,
    /// Redact PHI from free text before it reaches a log line
    pub redaction_enabled: bool,
    /// Replace redacted values with a short correlation hash instead of a mask
    pub hash_for_correlation: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            format: LogFormat::Pretty,
            redaction_enabled: true,
            hash_for_correlation: true,
        }
    }
}
