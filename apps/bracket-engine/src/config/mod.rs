//! Configuration loading for the bracket engine.
//!
//! YAML with `${VAR}` / `${VAR:-default}` environment interpolation. Every
//! section has defaults, so an empty file is a complete configuration.
//!
//! # Usage
//!
//! ```rust,ignore
//! use bracket_engine::config::load_config;
//!
//! let config = load_config(None)?;
//! println!("gateway: {}:{}", config.broker.host, config.broker.port);
//! ```

mod broker;
mod execution;
mod indicators;
mod observability;
mod reconciliation;
mod risk;

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use broker::BrokerConfig;
pub use execution::ExecutionConfig;
pub use indicators::IndicatorsConfig;
pub use observability::{LogFormat, ObservabilityConfig};
pub use reconciliation::ReconciliationConfig;
pub use risk::RiskConfig;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "BRACKET_ENGINE_CONFIG";

/// Config file used when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        /// Path.
        path: String,
        /// Cause.
        source: std::io::Error,
    },

    /// YAML did not parse.
    #[error("Failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// A value is out of range.
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Graceful shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Bound on cleanup before the process is force-terminated.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl ShutdownConfig {
    /// Timeout as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

const fn default_shutdown_timeout_secs() -> u64 {
    10
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Broker session.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Daily loss guard.
    #[serde(default)]
    pub risk: RiskConfig,
    /// Indicator engine.
    #[serde(default)]
    pub indicators: IndicatorsConfig,
    /// Order construction.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Reconciliation.
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Shutdown.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Config path from [`CONFIG_PATH_ENV`], or [`DEFAULT_CONFIG_PATH`].
#[must_use]
pub fn config_path_from_env() -> String {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

/// Load, interpolate and validate a config file.
///
/// # Errors
///
/// Returns error if the file cannot be read, parsed or validated.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or(DEFAULT_CONFIG_PATH);
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_string(),
        source: e,
    })?;
    load_config_from_string(&contents)
}

/// Load configuration from a YAML string.
///
/// # Errors
///
/// Returns error if parsing or validation fails.
pub fn load_config_from_string(yaml: &str) -> Result<Config, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    let config: Config = if interpolated.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml_bw::from_str(&interpolated)?
    };
    validate_config(&config)?;
    Ok(config)
}

#[allow(clippy::expect_used)] // Regex is compile-time constant
fn interpolate_env_vars(input: &str) -> String {
    use std::sync::OnceLock;

    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var regex is valid")
    });

    re.replace_all(input, |cap: &regex::Captures<'_>| {
        let default_value = cap.get(2).map_or("", |m| m.as_str());
        match cap.get(1).map(|m| std::env::var(m.as_str())) {
            Some(Ok(v)) if !v.is_empty() => v,
            _ => default_value.to_string(),
        }
    })
    .into_owned()
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.broker.connect_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "broker.connect_attempts must be at least 1".to_string(),
        ));
    }
    if config.indicators.atr_period == 0 {
        return Err(ConfigError::ValidationError(
            "indicators.atr_period must be positive".to_string(),
        ));
    }
    if !(config.indicators.atr_multiplier.is_finite() && config.indicators.atr_multiplier > 0.0) {
        return Err(ConfigError::ValidationError(
            "indicators.atr_multiplier must be positive".to_string(),
        ));
    }
    if config.indicators.retention == 0 {
        return Err(ConfigError::ValidationError(
            "indicators.retention must be positive".to_string(),
        ));
    }
    if config.indicators.ema_periods.contains(&0) {
        return Err(ConfigError::ValidationError(
            "indicators.ema_periods must not contain 0".to_string(),
        ));
    }
    if config.risk.daily_loss_threshold > Decimal::ZERO {
        return Err(ConfigError::ValidationError(
            "risk.daily_loss_threshold must not be positive".to_string(),
        ));
    }
    if config.execution.stop_epsilon <= Decimal::ZERO {
        return Err(ConfigError::ValidationError(
            "execution.stop_epsilon must be positive".to_string(),
        ));
    }
    if config.execution.default_reward_risk <= Decimal::ZERO {
        return Err(ConfigError::ValidationError(
            "execution.default_reward_risk must be positive".to_string(),
        ));
    }
    if config.execution.inbox_capacity == 0 {
        return Err(ConfigError::ValidationError(
            "execution.inbox_capacity must be positive".to_string(),
        ));
    }
    if config.risk.guard_interval_secs == 0 || config.reconciliation.interval_secs == 0 {
        return Err(ConfigError::ValidationError(
            "guard and reconciliation intervals must be positive".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BarSize, OrderType};
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn empty_file_is_default() {
        let config = load_config_from_string("").unwrap();
        assert_eq!(config.broker.port, 7497);
        assert_eq!(config.broker.connect_attempts, 5);
        assert_eq!(config.risk.daily_loss_threshold, dec!(-1000));
        assert_eq!(config.indicators.atr_period, 14);
        assert_eq!(config.indicators.bar_size, BarSize::Min5);
        assert_eq!(config.indicators.ema_periods, vec![9, 21, 50]);
        assert_eq!(config.execution.stop_epsilon, dec!(0.01));
        assert_eq!(config.execution.entry_order_type, OrderType::Limit);
        assert!(config.reconciliation.enabled);
        assert_eq!(config.observability.log_format, LogFormat::Pretty);
        assert_eq!(config.shutdown.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let yaml = r#"
broker:
  port: 4002
indicators:
  atr_multiplier: 2.5
  bar_size: "15 mins"
observability:
  log_format: json
"#;
        let config = load_config_from_string(yaml).unwrap();
        assert_eq!(config.broker.port, 4002);
        assert_eq!(config.broker.host, "127.0.0.1");
        assert!((config.indicators.atr_multiplier - 2.5).abs() < f64::EPSILON);
        assert_eq!(config.indicators.bar_size, BarSize::Min15);
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }

    #[test]
    fn env_var_default_when_missing() {
        let input = "host: ${BRACKET_ENGINE_TEST_NONEXISTENT_VAR:-10.0.0.5}";
        assert_eq!(interpolate_env_vars(input), "host: 10.0.0.5");
    }

    #[test]
    #[expect(clippy::literal_string_with_formatting_args)] // ${...} is env var syntax
    fn env_var_existing_wins_over_default() {
        let result = interpolate_env_vars("path: ${PATH:-fallback}");
        assert!(!result.contains("fallback"));
        assert!(!result.contains("${"));
    }

    #[test]
    fn rejects_invalid_values() {
        for yaml in [
            "broker:\n  connect_attempts: 0\n",
            "indicators:\n  atr_period: 0\n",
            "indicators:\n  atr_multiplier: -1.0\n",
            "indicators:\n  retention: 0\n",
            "risk:\n  daily_loss_threshold: 50\n",
            "execution:\n  stop_epsilon: 0\n",
            "execution:\n  inbox_capacity: 0\n",
        ] {
            let err = load_config_from_string(yaml).unwrap_err();
            assert!(matches!(err, ConfigError::ValidationError(_)), "{yaml}");
        }
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "risk:\n  daily_loss_threshold: -250\n  account_id: DU42").unwrap();
        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.risk.daily_loss_threshold, dec!(-250));
        assert_eq!(config.risk.account_id, "DU42");
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = load_config(Some("/nonexistent/bracket-engine.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }
}
