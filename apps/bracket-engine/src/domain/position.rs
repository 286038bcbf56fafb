//! Positions and the account risk session.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::shared::Symbol;

/// A position as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerPosition {
    /// Account.
    pub account: String,
    /// Symbol.
    pub symbol: Symbol,
    /// Signed quantity.
    pub quantity: Decimal,
    /// Average cost per share.
    pub avg_cost: Decimal,
}

/// Persisted position, one per symbol with nonzero quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRecord {
    /// Symbol.
    pub symbol: Symbol,
    /// Signed quantity.
    pub quantity: Decimal,
    /// Average cost per share.
    pub avg_cost: Decimal,
    /// Account.
    pub account_id: String,
    /// Last time the broker reported it.
    pub last_seen: DateTime<Utc>,
}

impl PositionRecord {
    /// Materialize from broker truth.
    #[must_use]
    pub fn from_broker(position: &BrokerPosition, seen: DateTime<Utc>) -> Self {
        Self {
            symbol: position.symbol.clone(),
            quantity: position.quantity,
            avg_cost: position.avg_cost,
            account_id: position.account.clone(),
            last_seen: seen,
        }
    }
}

/// A `PnL` push event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnlUpdate {
    /// Account.
    pub account: String,
    /// Daily PnL.
    pub daily_pnl: Decimal,
    /// Unrealized PnL.
    pub unrealized_pnl: Option<Decimal>,
    /// Realized PnL.
    pub realized_pnl: Option<Decimal>,
}

/// Process-wide daily risk state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskSession {
    /// Account.
    pub account_id: String,
    /// Latest daily PnL.
    pub daily_pnl: Decimal,
    /// Latest unrealized PnL.
    pub unrealized_pnl: Decimal,
    /// Latest realized PnL.
    pub realized_pnl: Decimal,
    /// Loss threshold (non-positive).
    pub threshold: Decimal,
    /// Time of the last update.
    pub updated_at: Option<DateTime<Utc>>,
}

impl RiskSession {
    /// A session that has not seen any PnL yet.
    #[must_use]
    pub fn new(account_id: impl Into<String>, threshold: Decimal) -> Self {
        Self {
            account_id: account_id.into(),
            daily_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            threshold,
            updated_at: None,
        }
    }

    /// Apply a PnL event. Absent components keep their previous value.
    pub fn apply(&mut self, update: &PnlUpdate) {
        self.daily_pnl = update.daily_pnl;
        if let Some(unrealized) = update.unrealized_pnl {
            self.unrealized_pnl = unrealized;
        }
        if let Some(realized) = update.realized_pnl {
            self.realized_pnl = realized;
        }
        self.updated_at = Some(Utc::now());
    }

    /// Daily loss at or beyond the threshold.
    #[must_use]
    pub fn is_breached(&self) -> bool {
        self.updated_at.is_some() && self.daily_pnl <= self.threshold
    }
}
