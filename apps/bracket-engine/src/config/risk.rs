//! Account risk and PnL guard configuration.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Daily loss guard settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Account to subscribe PnL for. Empty means the gateway's default.
    #[serde(default)]
    pub account_id: String,
    /// Liquidate everything when daily PnL falls to or below this value.
    #[serde(default = "default_daily_loss_threshold")]
    pub daily_loss_threshold: Decimal,
    /// Re-evaluation cadence while breached (seconds).
    #[serde(default = "default_guard_interval_secs")]
    pub guard_interval_secs: u64,
    /// After-hours limit close slippage allowance, in percent of price.
    #[serde(default = "default_close_limit_offset_pct")]
    pub close_limit_offset_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            daily_loss_threshold: default_daily_loss_threshold(),
            guard_interval_secs: default_guard_interval_secs(),
            close_limit_offset_pct: default_close_limit_offset_pct(),
        }
    }
}

impl RiskConfig {
    /// Guard cadence as a duration.
    #[must_use]
    pub const fn guard_interval(&self) -> Duration {
        Duration::from_secs(self.guard_interval_secs)
    }
}

fn default_daily_loss_threshold() -> Decimal {
    dec!(-1000)
}

const fn default_guard_interval_secs() -> u64 {
    15
}

fn default_close_limit_offset_pct() -> Decimal {
    dec!(0.1)
}
