//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, ObservabilityConfig};

/// Subscriber setup error.
#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    /// Bad filter directive in config.
    #[error("invalid log filter '{directive}': {message}")]
    InvalidFilter {
        /// Directive.
        directive: String,
        /// Parser message.
        message: String,
    },
    /// A global subscriber is already installed.
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Build the filter: `RUST_LOG` wins, otherwise the configured level.
fn build_filter(config: &ObservabilityConfig) -> Result<EnvFilter, TracingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.log_level).map_err(|e| TracingError::InvalidFilter {
        directive: config.log_level.clone(),
        message: e.to_string(),
    })
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Returns error if the configured filter is invalid or a subscriber is
/// already set.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), TracingError> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = match config.log_format {
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    result.map_err(|e| TracingError::AlreadyInstalled(e.to_string()))
}
