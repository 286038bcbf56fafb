//! Logging and metrics.

mod metrics;
mod tracing;

pub use self::metrics::{
    MetricsError, init_metrics, record_bracket_placed, record_daily_pnl, record_duplicate_fill,
    record_inbox_overflow, record_intent_rejected, record_liquidation_order, record_reconciliation,
    record_reconnect, record_tick_shed,
};
pub use self::tracing::{TracingError, init_tracing};
