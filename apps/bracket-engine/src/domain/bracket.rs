//! Bracket lifecycle.
//!
//! ```text
//! Pending -> ParentSubmitted -> ParentFilled -> BracketPlaced -> BracketFilled
//!                 |                  ^  |              |
//!                 |                  |  v              +------> BracketCancelled
//!                 +-> BracketCancelled  Error <- (any non-terminal)
//! ```
//!
//! `Error` is not terminal: a redelivered fill may retry bracket placement
//! from it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::order::BrokerOrderStatus;
use super::shared::{OrderId, PermId, Symbol};

/// Bracket lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BracketState {
    /// Intent validated, parent not yet sent.
    Pending,
    /// Parent order accepted by the broker.
    ParentSubmitted,
    /// Parent filled, children not placed.
    ParentFilled,
    /// Take-profit and stop-loss working.
    BracketPlaced,
    /// One child filled.
    BracketFilled,
    /// Cancelled before completion.
    BracketCancelled,
    /// Submission failed.
    Error,
}

impl BracketState {
    /// No transitions leave this state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::BracketFilled | Self::BracketCancelled)
    }

    /// Whether `self -> next` is allowed.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Self::Error)
                | (Self::Pending, Self::ParentSubmitted)
                | (
                    Self::ParentSubmitted,
                    Self::ParentFilled | Self::BracketCancelled
                )
                | (
                    Self::ParentFilled | Self::Error,
                    Self::ParentFilled | Self::BracketPlaced
                )
                | (
                    Self::BracketPlaced,
                    Self::BracketFilled | Self::BracketCancelled
                )
        )
    }

    /// Whether a parent fill in this state should attempt bracket placement.
    #[must_use]
    pub const fn accepts_fill(&self) -> bool {
        matches!(
            self,
            Self::ParentSubmitted | Self::ParentFilled | Self::Error
        )
    }
}

impl fmt::Display for BracketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::ParentSubmitted => "parent_submitted",
            Self::ParentFilled => "parent_filled",
            Self::BracketPlaced => "bracket_placed",
            Self::BracketFilled => "bracket_filled",
            Self::BracketCancelled => "bracket_cancelled",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Which leg of the OCA pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildRole {
    /// Limit order at the target.
    TakeProfit,
    /// Stop order at the stop.
    StopLoss,
}

/// One child order of a bracket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BracketChild {
    /// Role.
    pub role: ChildRole,
    /// Session order id.
    pub order_id: OrderId,
    /// Permanent order id.
    pub perm_id: PermId,
    /// Limit or stop price.
    pub price: Decimal,
    /// Last known status.
    pub status: BrokerOrderStatus,
}

/// A filled parent with its OCA exit pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BracketGroup {
    /// Symbol.
    pub symbol: Symbol,
    /// Parent session order id.
    pub parent_order_id: OrderId,
    /// Parent permanent id.
    pub parent_perm_id: PermId,
    /// OCA group id shared by both children.
    pub oca_group: String,
    /// Protected quantity.
    pub quantity: Decimal,
    /// Take-profit leg.
    pub take_profit: BracketChild,
    /// Stop-loss leg.
    pub stop_loss: BracketChild,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl BracketGroup {
    /// Child with the given order id.
    pub fn child_mut(&mut self, order_id: OrderId) -> Option<&mut BracketChild> {
        if self.take_profit.order_id == order_id {
            Some(&mut self.take_profit)
        } else if self.stop_loss.order_id == order_id {
            Some(&mut self.stop_loss)
        } else {
            None
        }
    }

    /// Whether `order_id` is one of the children.
    #[must_use]
    pub fn contains(&self, order_id: OrderId) -> bool {
        self.take_profit.order_id == order_id || self.stop_loss.order_id == order_id
    }

    /// Lifecycle state implied by the children's statuses, if terminal.
    #[must_use]
    pub const fn terminal_state(&self) -> Option<BracketState> {
        let tp = self.take_profit.status;
        let sl = self.stop_loss.status;
        if matches!(tp, BrokerOrderStatus::Filled) || matches!(sl, BrokerOrderStatus::Filled) {
            Some(BracketState::BracketFilled)
        } else if tp.is_dead() && sl.is_dead() {
            Some(BracketState::BracketCancelled)
        } else {
            None
        }
    }
}
