//! In-memory durable store.
//!
//! Suitable for tests and the paper-trading binary. Nothing survives a restart.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{DurableStore, OrderHistoryEntry, StoreError};
use crate::domain::{BrokerOrderStatus, FillEvent, OrderId, OrderRecord, PositionRecord, Symbol};

#[derive(Debug, Default)]
struct Tables {
    positions: BTreeMap<Symbol, PositionRecord>,
    orders: BTreeMap<OrderId, OrderHistoryEntry>,
    open: HashSet<OrderId>,
    exec_ids: HashMap<OrderId, HashSet<String>>,
}

/// In-memory implementation of [`DurableStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored positions.
    #[must_use]
    pub fn position_count(&self) -> usize {
        self.tables.read().positions.len()
    }

    /// Number of orders ever inserted.
    #[must_use]
    pub fn order_count(&self) -> usize {
        self.tables.read().orders.len()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn upsert_position(&self, record: &PositionRecord) -> Result<(), StoreError> {
        self.tables
            .write()
            .positions
            .insert(record.symbol.clone(), record.clone());
        Ok(())
    }

    async fn delete_position(&self, symbol: &Symbol) -> Result<(), StoreError> {
        self.tables.write().positions.remove(symbol);
        Ok(())
    }

    async fn list_positions(&self) -> Result<Vec<PositionRecord>, StoreError> {
        Ok(self.tables.read().positions.values().cloned().collect())
    }

    async fn insert_order(&self, order: &OrderRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        tables.orders.insert(
            order.order_id,
            OrderHistoryEntry {
                order: order.clone(),
                fills: Vec::new(),
            },
        );
        if order.is_open() {
            tables.open.insert(order.order_id);
        }
        Ok(())
    }

    async fn insert_fill(&self, order_id: OrderId, fill: &FillEvent) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.orders.contains_key(&order_id) {
            return Err(StoreError::NotFound {
                entity: "order",
                key: order_id.to_string(),
            });
        }
        if !tables
            .exec_ids
            .entry(order_id)
            .or_default()
            .insert(fill.exec_id.clone())
        {
            return Ok(());
        }
        if let Some(entry) = tables.orders.get_mut(&order_id) {
            entry.fills.push(fill.clone());
        }
        Ok(())
    }

    async fn get_order_history(&self, symbol: &Symbol) -> Result<Vec<OrderHistoryEntry>, StoreError> {
        let tables = self.tables.read();
        let mut history: Vec<_> = tables
            .orders
            .values()
            .filter(|e| &e.order.symbol == symbol)
            .cloned()
            .collect();
        history.sort_by_key(|e| (e.order.placed_at, e.order.order_id));
        Ok(history)
    }

    async fn list_open_orders(&self) -> Result<Vec<OrderRecord>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .orders
            .values()
            .filter(|e| tables.open.contains(&e.order.order_id))
            .map(|e| e.order.clone())
            .collect())
    }

    async fn remove_open_order(&self, order_id: OrderId) -> Result<bool, StoreError> {
        Ok(self.tables.write().open.remove(&order_id))
    }

    async fn mark_order_closed(
        &self,
        order_id: OrderId,
        status: BrokerOrderStatus,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let entry = tables
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "order",
                key: order_id.to_string(),
            })?;
        entry.order.closed_status = Some(status);
        tables.open.remove(&order_id);
        Ok(())
    }
}
