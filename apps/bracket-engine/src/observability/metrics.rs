//! Prometheus metrics for the bracket engine.
//!
//! Recording goes through the `metrics` facade and is a no-op until
//! [`init_metrics`] installs the exporter.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::error::ErrorCode;

/// Error type for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Listener address did not parse.
    #[error("invalid metrics address '{0}'")]
    InvalidAddress(String),
    /// Failed to install metrics exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

/// Start the Prometheus exporter serving `/metrics` on `addr`.
///
/// # Errors
///
/// Returns an error if the address is invalid or the exporter fails to start.
pub fn init_metrics(addr: &str) -> Result<(), MetricsError> {
    let listen_addr: SocketAddr = addr
        .parse()
        .map_err(|_| MetricsError::InvalidAddress(addr.to_string()))?;
    PrometheusBuilder::new()
        .with_http_listener(listen_addr)
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    tracing::info!(addr = %listen_addr, "Prometheus metrics exporter started");
    Ok(())
}

/// A bracket pair was submitted.
pub fn record_bracket_placed(symbol: &str) {
    counter!("brackets_placed_total", "symbol" => symbol.to_string()).increment(1);
}

/// A redelivered fill was dropped.
pub fn record_duplicate_fill() {
    counter!("duplicate_fills_total").increment(1);
}

/// An intent was rejected.
pub fn record_intent_rejected(code: ErrorCode) {
    counter!("intents_rejected_total", "reason" => code.reason()).increment(1);
}

/// The guard submitted a closing order.
pub fn record_liquidation_order(symbol: &str) {
    counter!("liquidation_orders_total", "symbol" => symbol.to_string()).increment(1);
}

/// The session reconnected after an unsolicited disconnect.
pub fn record_reconnect() {
    counter!("reconnects_total").increment(1);
}

/// Latest daily PnL.
pub fn record_daily_pnl(value: Decimal) {
    gauge!("daily_pnl").set(value.to_f64().unwrap_or_default());
}

/// A symbol inbox was full and an event was queued in overflow.
pub fn record_inbox_overflow(symbol: &str) {
    counter!("inbox_overflow_total", "symbol" => symbol.to_string()).increment(1);
}

/// A stale quote tick was shed from a backed-up inbox.
pub fn record_tick_shed(symbol: &str) {
    counter!("ticks_shed_total", "symbol" => symbol.to_string()).increment(1);
}

/// A reconciliation pass completed.
pub fn record_reconciliation(stale_orders: usize, deleted_positions: usize, errors: usize) {
    counter!("reconciliation_runs_total").increment(1);
    counter!("reconciliation_stale_orders_total").increment(stale_orders as u64);
    counter!("reconciliation_deleted_positions_total").increment(deleted_positions as u64);
    counter!("reconciliation_errors_total").increment(errors as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_address() {
        assert!(matches!(
            init_metrics("not-an-address"),
            Err(MetricsError::InvalidAddress(_))
        ));
    }

    #[test]
    fn recording_without_exporter_is_noop() {
        record_bracket_placed("AAPL");
        record_duplicate_fill();
        record_intent_rejected(ErrorCode::PriceUnavailable);
        record_daily_pnl(Decimal::new(-1234, 1));
    }
}
