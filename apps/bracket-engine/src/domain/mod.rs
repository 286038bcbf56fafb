//! Domain model shared by every engine component.
//!
//! - `shared`: identifiers (`Symbol`, `OrderId`, `PermId`)
//! - `market`: contracts, ticks, snapshots, bars
//! - `intent`: inbound trade intents
//! - `order`: order requests, statuses, fills
//! - `position`: broker positions, persisted records, risk session
//! - `bracket`: bracket lifecycle state and groups

pub mod bracket;
pub mod intent;
pub mod market;
pub mod order;
pub mod position;
pub mod shared;

pub use bracket::{BracketChild, BracketGroup, BracketState, ChildRole};
pub use intent::{Action, StopType, TradeIntent};
pub use market::{
    Bar, BarEvent, BarSize, Contract, IndicatorSnapshot, MarketSnapshot, SecurityType, TickUpdate,
    Trend, VolatilityStopState,
};
pub use order::{
    BrokerOrderStatus, FillEvent, OpenOrder, OrderAck, OrderRecord, OrderRequest, OrderRole,
    OrderSide, OrderStatusUpdate, OrderType, TimeInForce,
};
pub use position::{BrokerPosition, PnlUpdate, PositionRecord, RiskSession};
pub use shared::{OrderId, PermId, Symbol};
