//! Durable Store Port
//!
//! Order/fill history and the local position book. The engine is the only
//! writer of order and fill history; reconciliation is the only deleter of
//! positions.

mod in_memory;

pub use in_memory::InMemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{BrokerOrderStatus, FillEvent, OrderId, OrderRecord, PositionRecord, Symbol};

/// Store error.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Record not found.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Lookup key.
        key: String,
    },

    /// Backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// An order with its executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHistoryEntry {
    /// The order.
    pub order: OrderRecord,
    /// Fills, in arrival order.
    pub fills: Vec<FillEvent>,
}

/// Durable store port.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert or replace the position for its symbol.
    ///
    /// # Errors
    ///
    /// Returns error if persistence fails.
    async fn upsert_position(&self, record: &PositionRecord) -> Result<(), StoreError>;

    /// Delete the position for `symbol`. Deleting a missing position is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if persistence fails.
    async fn delete_position(&self, symbol: &Symbol) -> Result<(), StoreError>;

    /// All stored positions.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    async fn list_positions(&self) -> Result<Vec<PositionRecord>, StoreError>;

    /// Record a placed order. It joins the local open-order book.
    ///
    /// # Errors
    ///
    /// Returns error if persistence fails.
    async fn insert_order(&self, order: &OrderRecord) -> Result<(), StoreError>;

    /// Record an execution. Redelivered executions (same exec id) are ignored.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the order was never inserted.
    async fn insert_fill(&self, order_id: OrderId, fill: &FillEvent) -> Result<(), StoreError>;

    /// Orders for `symbol` with their fills, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    async fn get_order_history(&self, symbol: &Symbol) -> Result<Vec<OrderHistoryEntry>, StoreError>;

    /// Orders the engine still believes are working.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    async fn list_open_orders(&self) -> Result<Vec<OrderRecord>, StoreError>;

    /// Drop a stale order from the open-order book. History is kept.
    ///
    /// Returns whether the order was in the book.
    ///
    /// # Errors
    ///
    /// Returns error if persistence fails.
    async fn remove_open_order(&self, order_id: OrderId) -> Result<bool, StoreError>;

    /// Record a terminal status and drop the order from the open-order book.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the order was never inserted.
    async fn mark_order_closed(
        &self,
        order_id: OrderId,
        status: BrokerOrderStatus,
    ) -> Result<(), StoreError>;
}
