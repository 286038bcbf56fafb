//! Order requests, broker statuses and fills.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::market::Contract;
use super::shared::{OrderId, PermId, Symbol};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

impl OrderSide {
    /// The other side.
    #[must_use]
    pub const fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Side that flattens a signed position.
    #[must_use]
    pub fn closing(position: Decimal) -> Self {
        if position.is_sign_negative() {
            Self::Buy
        } else {
            Self::Sell
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => f.write_str("BUY"),
            Self::Sell => f.write_str("SELL"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Market.
    Market,
    /// Limit.
    #[default]
    Limit,
    /// Stop (market on trigger).
    Stop,
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Day.
    Day,
    /// Good till cancelled.
    #[default]
    Gtc,
}

/// An order to send to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Qualified contract.
    pub contract: Contract,
    /// Side.
    pub side: OrderSide,
    /// Type.
    pub order_type: OrderType,
    /// Quantity (shares).
    pub quantity: Decimal,
    /// Limit price.
    pub limit_price: Option<Decimal>,
    /// Stop trigger price.
    pub stop_price: Option<Decimal>,
    /// Time in force.
    pub tif: TimeInForce,
    /// Allow fills outside regular trading hours.
    pub outside_rth: bool,
    /// One-cancels-all group.
    pub oca_group: Option<String>,
    /// Free-form tag visible in the broker's order book.
    pub order_ref: Option<String>,
}

impl OrderRequest {
    fn base(contract: Contract, side: OrderSide, order_type: OrderType, quantity: Decimal) -> Self {
        Self {
            contract,
            side,
            order_type,
            quantity,
            limit_price: None,
            stop_price: None,
            tif: TimeInForce::Gtc,
            outside_rth: false,
            oca_group: None,
            order_ref: None,
        }
    }

    /// Market order.
    #[must_use]
    pub fn market(contract: Contract, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            tif: TimeInForce::Day,
            ..Self::base(contract, side, OrderType::Market, quantity)
        }
    }

    /// Limit order.
    #[must_use]
    pub fn limit(contract: Contract, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            limit_price: Some(price),
            ..Self::base(contract, side, OrderType::Limit, quantity)
        }
    }

    /// Stop order.
    #[must_use]
    pub fn stop(contract: Contract, side: OrderSide, quantity: Decimal, trigger: Decimal) -> Self {
        Self {
            stop_price: Some(trigger),
            ..Self::base(contract, side, OrderType::Stop, quantity)
        }
    }

    /// Put the order in an OCA group.
    #[must_use]
    pub fn with_oca(mut self, group: impl Into<String>) -> Self {
        self.oca_group = Some(group.into());
        self
    }

    /// Tag the order.
    #[must_use]
    pub fn with_ref(mut self, order_ref: impl Into<String>) -> Self {
        self.order_ref = Some(order_ref.into());
        self
    }

    /// Set the outside-RTH flag.
    #[must_use]
    pub const fn outside_rth(mut self, allowed: bool) -> Self {
        self.outside_rth = allowed;
        self
    }

    /// Set the time in force.
    #[must_use]
    pub const fn with_tif(mut self, tif: TimeInForce) -> Self {
        self.tif = tif;
        self
    }

    /// Symbol of the contract.
    #[must_use]
    pub const fn symbol(&self) -> &Symbol {
        &self.contract.symbol
    }

    /// Price that matters for this order type.
    #[must_use]
    pub const fn price(&self) -> Option<Decimal> {
        match self.order_type {
            OrderType::Market => None,
            OrderType::Limit => self.limit_price,
            OrderType::Stop => self.stop_price,
        }
    }
}

/// Broker acknowledgement of a placed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    /// Session order id.
    pub order_id: OrderId,
    /// Permanent order id.
    pub perm_id: PermId,
}

/// Broker order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrokerOrderStatus {
    /// Sent, not yet acknowledged.
    PendingSubmit,
    /// Accepted, waiting on a trigger or the session.
    PreSubmitted,
    /// Working.
    Submitted,
    /// Completely filled.
    Filled,
    /// Cancelled by the broker or a sibling fill.
    Cancelled,
    /// Cancelled on request.
    ApiCancelled,
    /// Rejected or otherwise dead.
    Inactive,
}

impl BrokerOrderStatus {
    /// No further status changes will follow.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::ApiCancelled | Self::Inactive
        )
    }

    /// Terminal without a fill.
    #[must_use]
    pub const fn is_dead(&self) -> bool {
        matches!(self, Self::Cancelled | Self::ApiCancelled | Self::Inactive)
    }
}

/// An `orderStatus` push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusUpdate {
    /// Session order id.
    pub order_id: OrderId,
    /// Permanent order id.
    pub perm_id: PermId,
    /// Symbol.
    pub symbol: Symbol,
    /// New status.
    pub status: BrokerOrderStatus,
    /// Filled quantity so far.
    pub filled: Decimal,
    /// Remaining quantity.
    pub remaining: Decimal,
    /// Average fill price.
    pub avg_fill_price: Option<Decimal>,
}

/// An execution report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    /// Broker execution id.
    pub exec_id: String,
    /// Session order id.
    pub order_id: OrderId,
    /// Permanent order id.
    pub perm_id: PermId,
    /// Symbol.
    pub symbol: Symbol,
    /// Side.
    pub side: OrderSide,
    /// Shares executed.
    pub shares: Decimal,
    /// Execution price.
    pub price: Decimal,
    /// Execution time.
    pub time: DateTime<Utc>,
}

/// A working order as reported by `requestOpenOrders`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    /// Session order id.
    pub order_id: OrderId,
    /// Permanent order id.
    pub perm_id: PermId,
    /// Symbol.
    pub symbol: Symbol,
    /// Side.
    pub side: OrderSide,
    /// Type.
    pub order_type: OrderType,
    /// Remaining quantity.
    pub quantity: Decimal,
    /// OCA group.
    pub oca_group: Option<String>,
    /// Order tag.
    pub order_ref: Option<String>,
    /// Status.
    pub status: BrokerOrderStatus,
}

/// What an order is for, from the engine's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderRole {
    /// Bracket entry.
    Parent,
    /// Bracket take-profit child.
    TakeProfit,
    /// Bracket stop-loss child.
    StopLoss,
    /// Guard liquidation.
    Liquidation,
}

/// The engine's durable record of an order it placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    /// Session order id.
    pub order_id: OrderId,
    /// Permanent order id.
    pub perm_id: PermId,
    /// Symbol.
    pub symbol: Symbol,
    /// Role.
    pub role: OrderRole,
    /// Side.
    pub side: OrderSide,
    /// Type.
    pub order_type: OrderType,
    /// Quantity.
    pub quantity: Decimal,
    /// Limit or stop price.
    pub price: Option<Decimal>,
    /// OCA group.
    pub oca_group: Option<String>,
    /// Placement time.
    pub placed_at: DateTime<Utc>,
    /// Final status, once known.
    pub closed_status: Option<BrokerOrderStatus>,
}

impl OrderRecord {
    /// Record for a just-acknowledged request.
    #[must_use]
    pub fn placed(request: &OrderRequest, ack: OrderAck, role: OrderRole) -> Self {
        Self {
            order_id: ack.order_id,
            perm_id: ack.perm_id,
            symbol: request.symbol().clone(),
            role,
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price(),
            oca_group: request.oca_group.clone(),
            placed_at: Utc::now(),
            closed_status: None,
        }
    }

    /// Still working as far as the engine knows.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.closed_status.is_none()
    }
}
