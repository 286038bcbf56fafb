//! Position sizing and risk calculation.
//!
//! Pure functions, no I/O. Given an entry, a stop and the account's risk
//! budget, [`size`] returns the share quantity, the take-profit price and the
//! intermediate figures used to reach them.
//!
//! # Example
//!
//! ```rust
//! use bracket_engine::domain::Action;
//! use bracket_engine::sizing::{SizingInput, size};
//! use rust_decimal_macros::dec;
//!
//! let result = size(&SizingInput {
//!     entry_price: dec!(100),
//!     stop_price: dec!(98),
//!     account_balance: dec!(10000),
//!     risk_pct: dec!(1),
//!     reward_risk: dec!(2),
//!     action: Action::Buy,
//! })
//! .unwrap();
//! assert_eq!(result.take_profit, dec!(104.00));
//! assert_eq!(result.quantity, dec!(50));
//! ```

mod calculator;
mod error;
mod types;

pub use calculator::{
    BUYING_POWER_FRACTION, COMMISSION_PER_SHARE, MIN_COMMISSION, MIN_RISK_FRACTION, size,
    take_profit_price,
};
pub use error::SizingError;
pub use types::{SizingInput, SizingResult};
