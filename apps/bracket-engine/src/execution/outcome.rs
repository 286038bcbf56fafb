//! Plans and outcomes reported back to intent submitters.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::pricing::PriceSource;
use crate::domain::{Action, BracketGroup, BracketState, OrderId, PermId, Symbol};
use crate::error::{EngineError, ErrorCode};

/// The priced and sized trade derived from an intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradePlan {
    /// Symbol.
    pub symbol: Symbol,
    /// Direction.
    pub action: Action,
    /// Entry price.
    pub entry_price: Decimal,
    /// Where the entry price came from.
    pub entry_source: PriceSource,
    /// Stop-loss price.
    pub stop_price: Decimal,
    /// Where the stop came from.
    pub stop_source: PriceSource,
    /// Share quantity.
    pub quantity: Decimal,
    /// Take-profit price.
    pub take_profit: Decimal,
    /// Reward:risk ratio applied.
    pub reward_risk: Decimal,
    /// Balance the plan was sized against.
    pub account_balance: Decimal,
    /// Estimated commission.
    pub commission: Decimal,
    /// Per-share risk after the minimum floor.
    pub per_share_risk: Decimal,
    /// Dollar risk budget.
    pub tolerated_risk: Decimal,
}

/// Immediate answer to [`crate::engine::Engine::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntentAck {
    /// Queued for processing.
    Accepted {
        /// Correlation id for later outcomes.
        intent_id: String,
    },
    /// Refused before any broker call.
    Rejected {
        /// Reason code.
        code: ErrorCode,
        /// Detail.
        message: String,
    },
}

impl IntentAck {
    /// Rejection from an engine error.
    #[must_use]
    pub fn rejected(err: &EngineError) -> Self {
        Self::Rejected {
            code: err.code(),
            message: err.message().to_string(),
        }
    }

    /// Intent id if accepted.
    #[must_use]
    pub fn intent_id(&self) -> Option<&str> {
        match self {
            Self::Accepted { intent_id } => Some(intent_id),
            Self::Rejected { .. } => None,
        }
    }
}

/// Asynchronous progress of an accepted intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IntentOutcome {
    /// Plan computed; nothing sent because `submit` was false.
    Planned {
        /// Correlation id.
        intent_id: String,
        /// Plan.
        plan: TradePlan,
    },
    /// Parent order accepted by the broker.
    ParentSubmitted {
        /// Correlation id.
        intent_id: String,
        /// Parent order id.
        order_id: OrderId,
        /// Parent permanent id.
        perm_id: PermId,
        /// Plan.
        plan: TradePlan,
    },
    /// Take-profit and stop-loss working.
    BracketPlaced {
        /// Correlation id.
        intent_id: String,
        /// The group.
        group: BracketGroup,
    },
    /// Bracket reached a terminal state.
    Closed {
        /// Correlation id.
        intent_id: String,
        /// Parent order id.
        parent_order_id: OrderId,
        /// Final state.
        state: BracketState,
    },
    /// Processing failed.
    Rejected {
        /// Correlation id.
        intent_id: String,
        /// Reason code.
        code: ErrorCode,
        /// Detail.
        message: String,
    },
}

impl IntentOutcome {
    /// Correlation id.
    #[must_use]
    pub fn intent_id(&self) -> &str {
        match self {
            Self::Planned { intent_id, .. }
            | Self::ParentSubmitted { intent_id, .. }
            | Self::BracketPlaced { intent_id, .. }
            | Self::Closed { intent_id, .. }
            | Self::Rejected { intent_id, .. } => intent_id,
        }
    }

    /// Failure outcome from an engine error.
    #[must_use]
    pub fn rejected(intent_id: impl Into<String>, err: &EngineError) -> Self {
        Self::Rejected {
            intent_id: intent_id.into(),
            code: err.code(),
            message: err.message().to_string(),
        }
    }
}

/// Result of handling one fill notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillOutcome {
    /// Bracket placed for this parent.
    BracketPlaced(BracketGroup),
    /// Parent only partly filled; waiting for the rest.
    PartialFill {
        /// Shares filled so far.
        filled: Decimal,
        /// Parent quantity.
        quantity: Decimal,
    },
    /// Fill of a bracket child, recorded.
    ChildFill,
    /// Parent already handled or in flight.
    Duplicate,
    /// Broker shows no matching position; a later notification may retry.
    NoPosition,
    /// Order not placed by this engine.
    NotTracked,
    /// Placement failed; a later notification may retry.
    Failed(EngineError),
}
