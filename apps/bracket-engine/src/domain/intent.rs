//! Inbound trade intents.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::market::BarSize;
use super::order::OrderSide;
use super::shared::Symbol;
use crate::error::EngineError;

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    /// Open or add to a long.
    Buy,
    /// Open or add to a short.
    Sell,
}

impl Action {
    /// Side of the entry order.
    #[must_use]
    pub const fn entry_side(&self) -> OrderSide {
        match self {
            Self::Buy => OrderSide::Buy,
            Self::Sell => OrderSide::Sell,
        }
    }

    /// Side of the take-profit and stop-loss orders.
    #[must_use]
    pub const fn exit_side(&self) -> OrderSide {
        self.entry_side().opposite()
    }

    /// Whether this opens a long.
    #[must_use]
    pub const fn is_long(&self) -> bool {
        matches!(self, Self::Buy)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => f.write_str("BUY"),
            Self::Sell => f.write_str("SELL"),
        }
    }
}

/// How the stop-loss is chosen when the intent does not carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopType {
    /// Volatility stop level for the symbol.
    #[default]
    VolatilityStop,
    /// Entry price minus (long) or plus (short) ATR times multiplier.
    Atr,
    /// The intent must carry its own stop.
    Explicit,
}

/// A validated request to open a bracketed position.
///
/// Zero `quantity` means "size from risk". Zero or absent `stop_loss`
/// means "derive from indicators". Zero `account_balance` means "ask the
/// broker".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    /// Ticker symbol.
    pub ticker: Symbol,
    /// Direction.
    pub action: Action,
    /// Share quantity.
    #[serde(default)]
    pub quantity: Decimal,
    /// Entry limit price.
    #[serde(default)]
    pub entry_price: Option<Decimal>,
    /// Stop-loss price.
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    /// Percent of balance at risk.
    #[serde(default = "default_risk_pct")]
    pub risk_pct: Decimal,
    /// Account balance used for sizing.
    #[serde(default)]
    pub account_balance: Decimal,
    /// Take-profit distance as a multiple of per-share risk.
    #[serde(default)]
    pub reward_risk: Option<Decimal>,
    /// Stop selection.
    #[serde(default)]
    pub stop_type: StopType,
    /// Bar timeframe for indicators.
    #[serde(default)]
    pub timeframe: BarSize,
    /// Place orders (true) or only compute the plan (false).
    #[serde(default = "default_submit")]
    pub submit: bool,
}

fn default_risk_pct() -> Decimal {
    dec!(1)
}

const fn default_submit() -> bool {
    true
}

impl TradeIntent {
    /// Intent with defaults for everything but ticker and direction.
    #[must_use]
    pub fn new(ticker: impl Into<Symbol>, action: Action) -> Self {
        Self {
            ticker: ticker.into(),
            action,
            quantity: Decimal::ZERO,
            entry_price: None,
            stop_loss: None,
            risk_pct: default_risk_pct(),
            account_balance: Decimal::ZERO,
            reward_risk: None,
            stop_type: StopType::default(),
            timeframe: BarSize::default(),
            submit: true,
        }
    }

    /// Explicit stop, treating zero as absent.
    #[must_use]
    pub fn explicit_stop(&self) -> Option<Decimal> {
        self.stop_loss.filter(|s| !s.is_zero())
    }

    /// Explicit entry price, treating zero as absent.
    #[must_use]
    pub fn explicit_entry(&self) -> Option<Decimal> {
        self.entry_price.filter(|p| !p.is_zero())
    }

    /// Explicit quantity, if not sizing from risk.
    #[must_use]
    pub fn explicit_quantity(&self) -> Option<Decimal> {
        (!self.quantity.is_zero()).then_some(self.quantity)
    }

    /// Check the intent before any broker call.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_INPUT` describing the first bad field.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.ticker.is_empty() {
            return Err(EngineError::invalid_input("ticker is empty"));
        }
        if self.quantity < Decimal::ZERO {
            return Err(EngineError::invalid_input("quantity must not be negative")
                .with_context("symbol", &self.ticker));
        }
        if self.entry_price.is_some_and(|p| p < Decimal::ZERO) {
            return Err(EngineError::invalid_input("entry price must be positive")
                .with_context("symbol", &self.ticker));
        }
        if self.stop_loss.is_some_and(|s| s < Decimal::ZERO) {
            return Err(EngineError::invalid_input("stop loss must be positive")
                .with_context("symbol", &self.ticker));
        }
        if self.risk_pct <= Decimal::ZERO || self.risk_pct > dec!(100) {
            return Err(EngineError::invalid_input("risk percent must be in (0, 100]")
                .with_context("symbol", &self.ticker));
        }
        if self.account_balance < Decimal::ZERO {
            return Err(EngineError::invalid_input("account balance must not be negative")
                .with_context("symbol", &self.ticker));
        }
        if self.reward_risk.is_some_and(|r| r <= Decimal::ZERO) {
            return Err(EngineError::invalid_input("reward:risk ratio must be positive")
                .with_context("symbol", &self.ticker));
        }
        if self.stop_type == StopType::Explicit && self.explicit_stop().is_none() {
            return Err(EngineError::invalid_input("explicit stop type requires a stop loss")
                .with_context("symbol", &self.ticker));
        }
        if let (Some(entry), Some(stop)) = (self.explicit_entry(), self.explicit_stop()) {
            let wrong_side = match self.action {
                Action::Buy => stop >= entry,
                Action::Sell => stop <= entry,
            };
            if wrong_side {
                return Err(EngineError::invalid_input(format!(
                    "stop {stop} is on the wrong side of entry {entry} for {}",
                    self.action
                ))
                .with_context("symbol", &self.ticker));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn minimal_json_uses_defaults() {
        let intent: TradeIntent =
            serde_json::from_str(r#"{"ticker":"aapl","action":"BUY"}"#).unwrap();
        assert_eq!(intent.ticker.as_str(), "AAPL");
        assert_eq!(intent.risk_pct, dec!(1));
        assert!(intent.submit);
        assert_eq!(intent.stop_type, StopType::VolatilityStop);
        assert!(intent.explicit_quantity().is_none());
        intent.validate().unwrap();
    }

    #[test]
    fn json_ticker_is_trimmed_and_blank_is_rejected() {
        let intent: TradeIntent =
            serde_json::from_str(r#"{"ticker":"  tsla ","action":"SELL"}"#).unwrap();
        assert_eq!(intent.ticker, Symbol::new("TSLA"));

        let blank: TradeIntent =
            serde_json::from_str(r#"{"ticker":"   ","action":"BUY"}"#).unwrap();
        assert_eq!(blank.validate().unwrap_err().code(), ErrorCode::InvalidInput);
    }

    #[test]
    fn zero_stop_means_derive() {
        let mut intent = TradeIntent::new("AAPL", Action::Buy);
        intent.stop_loss = Some(Decimal::ZERO);
        assert!(intent.explicit_stop().is_none());
    }

    #[test]
    fn rejects_bad_fields() {
        let mut intent = TradeIntent::new("AAPL", Action::Buy);
        intent.entry_price = Some(dec!(-1));
        assert_eq!(intent.validate().unwrap_err().code(), ErrorCode::InvalidInput);

        let mut intent = TradeIntent::new("AAPL", Action::Buy);
        intent.quantity = dec!(-5);
        assert!(intent.validate().is_err());

        let mut intent = TradeIntent::new("AAPL", Action::Sell);
        intent.risk_pct = Decimal::ZERO;
        assert!(intent.validate().is_err());

        let mut intent = TradeIntent::new("AAPL", Action::Buy);
        intent.stop_type = StopType::Explicit;
        assert!(intent.validate().is_err());
    }

    #[test]
    fn rejects_stop_on_wrong_side() {
        let mut intent = TradeIntent::new("AAPL", Action::Buy);
        intent.entry_price = Some(dec!(100));
        intent.stop_loss = Some(dec!(101));
        assert!(intent.validate().is_err());

        intent.action = Action::Sell;
        intent.validate().unwrap();
    }

    #[test]
    fn action_sides() {
        assert_eq!(Action::Buy.exit_side(), OrderSide::Sell);
        assert_eq!(Action::Sell.exit_side(), OrderSide::Buy);
    }
}
