//! Broker state captured for one reconciliation pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ReconciliationError;
use crate::broker::BrokerSession;
use crate::domain::{BrokerPosition, OpenOrder};

/// Authoritative broker state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerStateSnapshot {
    /// Working orders.
    pub orders: Vec<OpenOrder>,
    /// Positions, including any reported as zero.
    pub positions: Vec<BrokerPosition>,
    /// Fetch time.
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Fetch open orders and positions from the broker.
///
/// # Errors
///
/// Returns the session error from either request.
pub async fn fetch_broker_state(
    session: &BrokerSession,
) -> Result<BrokerStateSnapshot, ReconciliationError> {
    let orders = session.request_open_orders().await?;
    let positions = session.request_positions().await?;
    Ok(BrokerStateSnapshot {
        orders,
        positions,
        fetched_at: Some(Utc::now()),
    })
}
