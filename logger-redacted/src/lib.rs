//! Logging for the ClinDoc engine
//!
//! Two concerns live here:
//!
//! - **Subscriber setup**: [`init`] installs a `tracing-subscriber` registry with
//!   an `EnvFilter` (`RUST_LOG` wins over the configured level) and either a
//!   pretty or a JSON formatter.
//! - **PHI redaction**: [`PiiRedactor`] scrubs emails, phone numbers, SSNs,
//!   medical record numbers, dates and IP addresses out of free text before it
//!   is attached to a log event. Structured fields carrying record ids are left
//!   alone; only text that may echo patient data (remote error bodies, user
//!   input) goes through the redactor.
//!
//! # Example
//!
//! ```no_run
//! use logger_redacted::{init, LoggerConfig, PiiRedactor};
//!
//! init(&LoggerConfig::default()).expect("logger");
//! let redactor = PiiRedactor::default();
//! tracing::warn!(body = %redactor.redact("no chart for MRN123456"), "remote rejected request");
//! ```

pub mod config;
pub mod redactor;

pub use config::*;
pub use redactor::*;

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Invalid log filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("Failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Fails when the configured level is not a valid filter directive or when a
/// global subscriber is already installed.
pub fn init(config: &LoggerConfig) -> Result<(), LoggerError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| LoggerError::InvalidFilter {
            directive: config.log_level.clone(),
            reason: e.to_string(),
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
    };

    installed.map_err(|e| LoggerError::Init(e.to_string()))
}
