//! Sizing input and output.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::Action;

/// Inputs to [`super::size`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizingInput {
    /// Entry price.
    pub entry_price: Decimal,
    /// Stop-loss price.
    pub stop_price: Decimal,
    /// Account balance.
    pub account_balance: Decimal,
    /// Percent of balance at risk (1 = 1%).
    pub risk_pct: Decimal,
    /// Take-profit distance as a multiple of per-share risk.
    pub reward_risk: Decimal,
    /// Direction.
    pub action: Action,
}

/// Output of [`super::size`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizingResult {
    /// Whole shares, at least 1.
    pub quantity: Decimal,
    /// Take-profit price, rounded to cents.
    pub take_profit: Decimal,
    /// Estimated round-trip commission.
    pub commission: Decimal,
    /// Distance from entry to stop, after the minimum floor.
    pub per_share_risk: Decimal,
    /// Dollar risk budget net of commission.
    pub tolerated_risk: Decimal,
}
