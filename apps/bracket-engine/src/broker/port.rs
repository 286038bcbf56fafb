//! Broker Gateway Port (Driven Port)
//!
//! Interface for a persistent brokerage session. Any protocol client
//! satisfying these semantics is substitutable.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::domain::{
    Bar, BarEvent, BarSize, BrokerPosition, Contract, FillEvent, OpenOrder, OrderAck, OrderId,
    OrderRequest, OrderStatusUpdate, PnlUpdate, TickUpdate,
};

/// Historical data type requested for indicator bars.
pub const WHAT_TO_SHOW: &str = "TRADES";

/// Parameters of `requestHistoricalBars`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalBarsRequest {
    /// Qualified contract.
    pub contract: Contract,
    /// Lookback, in broker duration syntax (`"2 D"`).
    pub duration: String,
    /// Bar size.
    pub bar_size: BarSize,
    /// Data type (`TRADES`, `MIDPOINT`).
    pub what_to_show: String,
    /// Regular trading hours only.
    pub use_rth: bool,
}

/// Account values from `requestAccountSummary`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    /// Account.
    pub account: String,
    /// Net liquidation value.
    pub net_liquidation: Decimal,
    /// Available funds.
    pub available_funds: Decimal,
    /// Buying power.
    pub buying_power: Decimal,
}

/// A push event from the broker session.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// Quote update (`pendingTickers`).
    Tick(TickUpdate),
    /// A bar closed on a realtime subscription.
    BarClosed(BarEvent),
    /// Order status change.
    OrderStatus(OrderStatusUpdate),
    /// Execution.
    Fill(FillEvent),
    /// Account PnL.
    Pnl(PnlUpdate),
    /// Position update.
    Position(BrokerPosition),
    /// Session dropped.
    Disconnected,
    /// Broker error message.
    Error {
        /// Broker error code.
        code: i32,
        /// Message.
        message: String,
        /// Order the error refers to.
        order_id: Option<OrderId>,
    },
}

/// Broker gateway error.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Not connected.
    #[error("not connected to broker")]
    NotConnected,

    /// Connection attempt failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Ticker did not resolve to a contract.
    #[error("contract qualification failed for {symbol}: {message}")]
    QualificationFailed {
        /// Symbol.
        symbol: String,
        /// Broker message.
        message: String,
    },

    /// Order rejected.
    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// Order not found.
    #[error("order not found: {0}")]
    OrderNotFound(OrderId),

    /// Request did not complete in time.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Operation name.
        operation: &'static str,
        /// Timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Market data request failed.
    #[error("market data unavailable: {0}")]
    MarketData(String),

    /// Unknown error.
    #[error("broker error: {0}")]
    Unknown(String),
}

/// Broker gateway port.
///
/// Implementations own the wire protocol. Push events are delivered through
/// the broadcast channel returned by [`BrokerGateway::events`].
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Open the session.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Close the session. Calling it on a closed session is a no-op.
    async fn disconnect(&self) -> Result<(), BrokerError>;

    /// Whether the session is open.
    fn is_connected(&self) -> bool;

    /// Subscribe to push events.
    fn events(&self) -> broadcast::Receiver<BrokerEvent>;

    /// Resolve a contract to its broker id.
    async fn qualify_contract(&self, contract: &Contract) -> Result<Contract, BrokerError>;

    /// Place an order.
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, BrokerError>;

    /// Cancel a working order.
    async fn cancel_order(&self, order_id: OrderId) -> Result<(), BrokerError>;

    /// Fetch historical bars.
    async fn request_historical_bars(
        &self,
        request: &HistoricalBarsRequest,
    ) -> Result<Vec<Bar>, BrokerError>;

    /// Subscribe to realtime bars; bars arrive as [`BrokerEvent::BarClosed`].
    async fn request_realtime_bars(
        &self,
        contract: &Contract,
        bar_size: BarSize,
    ) -> Result<(), BrokerError>;

    /// Snapshot of all positions.
    async fn request_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    /// Snapshot of all working orders.
    async fn request_open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError>;

    /// Subscribe to account PnL; updates arrive as [`BrokerEvent::Pnl`].
    async fn request_pnl(&self, account: &str) -> Result<(), BrokerError>;

    /// Account balances.
    async fn request_account_summary(&self) -> Result<AccountSummary, BrokerError>;
}
