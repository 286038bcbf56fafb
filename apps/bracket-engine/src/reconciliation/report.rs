//! Reconciliation report.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{OrderId, Symbol};

/// Result of a reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    /// Local open orders compared.
    pub orders_checked: usize,
    /// Local orders the broker no longer reports.
    pub stale_orders_removed: Vec<OrderId>,
    /// Positions written from broker truth.
    pub positions_upserted: usize,
    /// Local positions removed as flat or unknown.
    pub positions_deleted: Vec<Symbol>,
    /// Per-item failures. The pass continued past each one.
    pub errors: Vec<String>,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl ReconciliationReport {
    /// No item failed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}
