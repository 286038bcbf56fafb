//! Broker session management.
//!
//! - [`BrokerGateway`]: the port any protocol client implements
//! - [`ConnectPolicy`]: bounded, fixed-delay connect retry
//! - [`BrokerSession`]: connection lifecycle, serialized requests,
//!   automatic reconnect and event fan-out

mod port;
mod retry;
mod session;

pub use port::{
    AccountSummary, BrokerError, BrokerEvent, BrokerGateway, HistoricalBarsRequest, WHAT_TO_SHOW,
};
pub use retry::ConnectPolicy;
pub use session::{BrokerSession, SessionError, SessionSettings, SessionState};
