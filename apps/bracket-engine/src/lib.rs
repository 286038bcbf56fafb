// Allow unwrap/expect in tests - tests should panic on unexpected errors
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::items_after_statements
    )
)]

//! Bracket Engine - Rust Core Library
//!
//! Turns trade intents into supervised bracket positions against a
//! brokerage gateway.
//!
//! # Components
//!
//! - **Broker session** (`broker`): one persistent gateway session with
//!   bounded reconnect, request timeouts and resubscription.
//! - **Market data** (`market_data`, `indicators`): per-symbol quote
//!   snapshots, bar series, Wilder ATR, EMA set and the volatility stop.
//! - **Sizing** (`sizing`): shares from account risk, commission-adjusted.
//! - **Execution** (`execution`): the bracket state machine. The parent
//!   fill attaches one take-profit/stop-loss OCA pair, exactly once per
//!   permanent order id.
//! - **Guard** (`guard`): daily-loss kill switch that flattens positions.
//! - **Reconciliation** (`reconciliation`): converges the durable store on
//!   broker truth.
//!
//! [`engine::Engine`] wires them together over a [`broker::BrokerGateway`]
//! and a [`persistence::DurableStore`]. [`paper::PaperGateway`] is an
//! in-process gateway for tests and the demo binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod broker;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod execution;
pub mod guard;
pub mod indicators;
pub mod market_data;
pub mod observability;
pub mod paper;
pub mod persistence;
pub mod reconciliation;
pub mod sizing;

pub use engine::Engine;
pub use error::{EngineError, ErrorCode, Severity};
