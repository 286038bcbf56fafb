//! Indicator engine configuration.

use serde::{Deserialize, Serialize};

use crate::domain::BarSize;

/// ATR, volatility stop and EMA settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorsConfig {
    /// ATR lookback.
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    /// ATR multiplier for the volatility stop.
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: f64,
    /// Default bar size.
    #[serde(default)]
    pub bar_size: BarSize,
    /// Bars kept per series.
    #[serde(default = "default_retention")]
    pub retention: usize,
    /// EMA periods.
    #[serde(default = "default_ema_periods")]
    pub ema_periods: Vec<usize>,
    /// Warm-up history length, broker duration syntax.
    #[serde(default = "default_history_duration")]
    pub history_duration: String,
    /// Warm-up on regular trading hours only.
    #[serde(default)]
    pub use_rth: bool,
}

impl Default for IndicatorsConfig {
    fn default() -> Self {
        Self {
            atr_period: default_atr_period(),
            atr_multiplier: default_atr_multiplier(),
            bar_size: BarSize::default(),
            retention: default_retention(),
            ema_periods: default_ema_periods(),
            history_duration: default_history_duration(),
            use_rth: false,
        }
    }
}

const fn default_atr_period() -> usize {
    14
}

const fn default_atr_multiplier() -> f64 {
    1.5
}

const fn default_retention() -> usize {
    500
}

fn default_ema_periods() -> Vec<usize> {
    vec![9, 21, 50]
}

fn default_history_duration() -> String {
    "2 D".to_string()
}
