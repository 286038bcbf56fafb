//! PnL Guard / Auto-Liquidation.

mod market_hours;
mod pnl_guard;

pub use market_hours::{Clock, FixedClock, SystemClock, is_regular_trading_hours};
pub use pnl_guard::{GUARD_ORDER_REF, GuardError, GuardReport, PnlGuard, close_limit_price};
