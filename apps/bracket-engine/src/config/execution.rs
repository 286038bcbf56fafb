//! Bracket execution configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::domain::OrderType;

/// Order construction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Offset applied to an indicator-derived stop, away from price.
    #[serde(default = "default_stop_epsilon")]
    pub stop_epsilon: Decimal,
    /// Allow orders to work outside regular trading hours.
    #[serde(default = "default_outside_rth")]
    pub outside_rth: bool,
    /// Reward:risk ratio when the intent carries none.
    #[serde(default = "default_reward_risk")]
    pub default_reward_risk: Decimal,
    /// Per-symbol inbox capacity.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    /// Parent order type (`limit` or `market`).
    #[serde(default)]
    pub entry_order_type: OrderType,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            stop_epsilon: default_stop_epsilon(),
            outside_rth: default_outside_rth(),
            default_reward_risk: default_reward_risk(),
            inbox_capacity: default_inbox_capacity(),
            entry_order_type: OrderType::default(),
        }
    }
}

fn default_stop_epsilon() -> Decimal {
    dec!(0.01)
}

const fn default_outside_rth() -> bool {
    true
}

fn default_reward_risk() -> Decimal {
    dec!(2)
}

const fn default_inbox_capacity() -> usize {
    256
}
