//! Order and position reconciliation with the broker.
//!
//! The broker is authoritative. Local open orders the broker no longer
//! reports are dropped from the open-order book (history is kept). Broker
//! positions with a nonzero quantity are upserted, every other local
//! position is deleted. This is the only code path that deletes positions.

mod error;
mod report;
mod snapshot;

pub use error::ReconciliationError;
pub use report::ReconciliationReport;
pub use snapshot::{BrokerStateSnapshot, fetch_broker_state};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::BrokerSession;
use crate::domain::{OrderId, PositionRecord, Symbol};
use crate::observability;
use crate::persistence::DurableStore;

/// Reconciles the durable store against broker state.
pub struct Reconciler {
    session: Arc<BrokerSession>,
    store: Arc<dyn DurableStore>,
    last_report: RwLock<Option<ReconciliationReport>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("last_run", &self.last_report.read().as_ref().map(|r| r.completed_at))
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(session: Arc<BrokerSession>, store: Arc<dyn DurableStore>) -> Self {
        Self {
            session,
            store,
            last_report: RwLock::new(None),
        }
    }

    /// Report from the most recent pass.
    #[must_use]
    pub fn last_report(&self) -> Option<ReconciliationReport> {
        self.last_report.read().clone()
    }

    /// Fetch broker state and reconcile against it.
    ///
    /// # Errors
    ///
    /// Returns an error only if broker state could not be fetched. Store
    /// failures on individual items are collected in the report.
    pub async fn reconcile(&self) -> Result<ReconciliationReport, ReconciliationError> {
        let broker = fetch_broker_state(&self.session).await?;
        Ok(self.reconcile_with(&broker).await)
    }

    /// Reconcile the store against an already fetched broker snapshot.
    pub async fn reconcile_with(&self, broker: &BrokerStateSnapshot) -> ReconciliationReport {
        let start = Instant::now();
        let now = Utc::now();
        let mut errors = Vec::new();

        info!(
            broker_orders = broker.orders.len(),
            broker_positions = broker.positions.len(),
            "Starting reconciliation"
        );

        // Phase 1: open orders, matched on (order id, symbol)
        let working: HashSet<(OrderId, &Symbol)> = broker
            .orders
            .iter()
            .map(|o| (o.order_id, &o.symbol))
            .collect();
        let mut orders_checked = 0;
        let mut stale_orders_removed = Vec::new();
        match self.store.list_open_orders().await {
            Ok(local) => {
                orders_checked = local.len();
                for order in local {
                    if working.contains(&(order.order_id, &order.symbol)) {
                        continue;
                    }
                    match self.store.remove_open_order(order.order_id).await {
                        Ok(_) => {
                            debug!(symbol = %order.symbol, order_id = %order.order_id, "Removed stale local order");
                            stale_orders_removed.push(order.order_id);
                        }
                        Err(err) => {
                            warn!(symbol = %order.symbol, order_id = %order.order_id, error = %err, "Failed to remove stale order");
                            errors.push(format!("order {}: {err}", order.order_id));
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "Failed to list local open orders");
                errors.push(format!("open orders: {err}"));
            }
        }

        // Phase 2: positions, matched on symbol
        let held: HashMap<&Symbol, &crate::domain::BrokerPosition> = broker
            .positions
            .iter()
            .filter(|p| !p.quantity.is_zero())
            .map(|p| (&p.symbol, p))
            .collect();
        let mut positions_upserted = 0;
        for position in held.values() {
            let record = PositionRecord::from_broker(position, now);
            match self.store.upsert_position(&record).await {
                Ok(()) => positions_upserted += 1,
                Err(err) => {
                    warn!(symbol = %position.symbol, error = %err, "Failed to upsert position");
                    errors.push(format!("position {}: {err}", position.symbol));
                }
            }
        }

        let mut positions_deleted = Vec::new();
        match self.store.list_positions().await {
            Ok(local) => {
                for record in local.into_iter().filter(|r| !held.contains_key(&r.symbol)) {
                    match self.store.delete_position(&record.symbol).await {
                        Ok(()) => {
                            debug!(symbol = %record.symbol, "Deleted flat local position");
                            positions_deleted.push(record.symbol);
                        }
                        Err(err) => {
                            warn!(symbol = %record.symbol, error = %err, "Failed to delete position");
                            errors.push(format!("position {}: {err}", record.symbol));
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "Failed to list local positions");
                errors.push(format!("positions: {err}"));
            }
        }

        let report = ReconciliationReport {
            orders_checked,
            stale_orders_removed,
            positions_upserted,
            positions_deleted,
            errors,
            completed_at: Utc::now(),
            duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        observability::record_reconciliation(
            report.stale_orders_removed.len(),
            report.positions_deleted.len(),
            report.errors.len(),
        );
        if report.passed() {
            info!(
                stale_orders = report.stale_orders_removed.len(),
                upserted = report.positions_upserted,
                deleted = report.positions_deleted.len(),
                duration_ms = report.duration_ms,
                "Reconciliation complete"
            );
        } else {
            warn!(
                errors = report.errors.len(),
                stale_orders = report.stale_orders_removed.len(),
                deleted = report.positions_deleted.len(),
                "Reconciliation completed with failures"
            );
        }
        *self.last_report.write() = Some(report.clone());
        report
    }

    /// Reconcile now, then every `interval`, until `shutdown`.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile().await {
                        warn!(error = %err, "Reconciliation pass failed");
                    }
                }
            }
        }
        debug!("Reconciliation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SessionSettings;
    use crate::domain::{
        BrokerOrderStatus, BrokerPosition, Contract, FillEvent, OpenOrder, OrderAck, OrderRecord,
        OrderRequest, OrderRole, OrderSide, OrderType, PermId,
    };
    use crate::paper::PaperGateway;
    use crate::persistence::{InMemoryStore, OrderHistoryEntry, StoreError};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn record(id: i64, symbol: &str) -> OrderRecord {
        let request = OrderRequest::limit(
            Contract::stock(symbol).qualified(1),
            OrderSide::Sell,
            dec!(1),
            dec!(10),
        );
        OrderRecord::placed(
            &request,
            OrderAck {
                order_id: OrderId(id),
                perm_id: PermId(id),
            },
            OrderRole::TakeProfit,
        )
    }

    fn open(id: i64, symbol: &str) -> OpenOrder {
        OpenOrder {
            order_id: OrderId(id),
            perm_id: PermId(id),
            symbol: Symbol::new(symbol),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            quantity: dec!(1),
            oca_group: None,
            order_ref: None,
            status: BrokerOrderStatus::Submitted,
        }
    }

    fn position(symbol: &str, quantity: Decimal) -> BrokerPosition {
        BrokerPosition {
            account: "DU1".to_string(),
            symbol: Symbol::new(symbol),
            quantity,
            avg_cost: dec!(10),
        }
    }

    fn local_position(symbol: &str) -> PositionRecord {
        PositionRecord::from_broker(&position(symbol, dec!(5)), Utc::now())
    }

    async fn reconciler(store: Arc<dyn DurableStore>) -> Reconciler {
        let session = BrokerSession::new(
            Arc::new(PaperGateway::new()),
            SessionSettings {
                connect_attempts: 1,
                connect_retry_delay: Duration::ZERO,
                reconnect_delay: Duration::from_millis(10),
                request_timeout: Duration::from_secs(1),
            },
        );
        session.connect().await.unwrap();
        Reconciler::new(session, store)
    }

    #[tokio::test]
    async fn drops_stale_orders_and_flat_positions() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_order(&record(1, "AAPL")).await.unwrap();
        store.insert_order(&record(2, "AAPL")).await.unwrap();
        store.insert_order(&record(3, "MSFT")).await.unwrap();
        store.upsert_position(&local_position("AAPL")).await.unwrap();
        store.upsert_position(&local_position("TSLA")).await.unwrap();
        store.upsert_position(&local_position("NVDA")).await.unwrap();

        let r = reconciler(store.clone()).await;
        let broker = BrokerStateSnapshot {
            // order 3 is reported under another symbol and does not match
            orders: vec![open(1, "AAPL"), open(3, "AMD"), open(9, "QQQ")],
            positions: vec![
                position("AAPL", dec!(7)),
                position("TSLA", Decimal::ZERO),
                position("SPY", dec!(-2)),
            ],
            fetched_at: None,
        };
        let report = r.reconcile_with(&broker).await;

        assert!(report.passed());
        assert_eq!(report.orders_checked, 3);
        let mut stale = report.stale_orders_removed.clone();
        stale.sort();
        assert_eq!(stale, vec![OrderId(2), OrderId(3)]);
        let open_ids: Vec<_> = store
            .list_open_orders()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.order_id)
            .collect();
        assert_eq!(open_ids, vec![OrderId(1)]);

        let mut symbols: Vec<_> = store
            .list_positions()
            .await
            .unwrap()
            .into_iter()
            .map(|p| (p.symbol.to_string(), p.quantity))
            .collect();
        symbols.sort();
        assert_eq!(
            symbols,
            vec![("AAPL".to_string(), dec!(7)), ("SPY".to_string(), dec!(-2))]
        );
        assert_eq!(report.positions_upserted, 2);
        assert_eq!(report.positions_deleted.len(), 2);
        assert!(r.last_report().is_some());
    }

    #[tokio::test]
    async fn fetches_from_broker() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_position(&local_position("AAPL")).await.unwrap();
        let paper = Arc::new(PaperGateway::new());
        paper.set_position("MSFT", dec!(3), dec!(300));
        let session = BrokerSession::new(paper.clone(), SessionSettings::default());
        session.connect().await.unwrap();

        let report = Reconciler::new(session, store.clone())
            .reconcile()
            .await
            .unwrap();
        assert_eq!(report.positions_deleted, vec![Symbol::new("AAPL")]);
        assert_eq!(store.position_count(), 1);
    }

    /// Store that refuses to delete one symbol.
    struct StickyStore {
        inner: InMemoryStore,
        sticky: Symbol,
    }

    #[async_trait]
    impl DurableStore for StickyStore {
        async fn upsert_position(&self, record: &PositionRecord) -> Result<(), StoreError> {
            self.inner.upsert_position(record).await
        }
        async fn delete_position(&self, symbol: &Symbol) -> Result<(), StoreError> {
            if symbol == &self.sticky {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            self.inner.delete_position(symbol).await
        }
        async fn list_positions(&self) -> Result<Vec<PositionRecord>, StoreError> {
            self.inner.list_positions().await
        }
        async fn insert_order(&self, order: &OrderRecord) -> Result<(), StoreError> {
            self.inner.insert_order(order).await
        }
        async fn insert_fill(&self, order_id: OrderId, fill: &FillEvent) -> Result<(), StoreError> {
            self.inner.insert_fill(order_id, fill).await
        }
        async fn get_order_history(
            &self,
            symbol: &Symbol,
        ) -> Result<Vec<OrderHistoryEntry>, StoreError> {
            self.inner.get_order_history(symbol).await
        }
        async fn list_open_orders(&self) -> Result<Vec<OrderRecord>, StoreError> {
            self.inner.list_open_orders().await
        }
        async fn remove_open_order(&self, order_id: OrderId) -> Result<bool, StoreError> {
            self.inner.remove_open_order(order_id).await
        }
        async fn mark_order_closed(
            &self,
            order_id: OrderId,
            status: BrokerOrderStatus,
        ) -> Result<(), StoreError> {
            self.inner.mark_order_closed(order_id, status).await
        }
    }

    #[tokio::test]
    async fn one_failed_delete_does_not_stop_the_pass() {
        let store = Arc::new(StickyStore {
            inner: InMemoryStore::new(),
            sticky: Symbol::new("AAPL"),
        });
        store.upsert_position(&local_position("AAPL")).await.unwrap();
        store.upsert_position(&local_position("MSFT")).await.unwrap();

        let r = reconciler(store.clone()).await;
        let report = r.reconcile_with(&BrokerStateSnapshot::default()).await;
        assert!(!report.passed());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.positions_deleted, vec![Symbol::new("MSFT")]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn converges_to_broker_truth(
            local in proptest::collection::btree_set(1i64..40, 0..15),
            broker in proptest::collection::btree_set(1i64..40, 0..15),
            positions in proptest::collection::btree_map(0usize..6, -3i64..4, 0..6),
        ) {
            const SYMBOLS: [&str; 6] = ["AAPL", "MSFT", "TSLA", "NVDA", "AMD", "SPY"];
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let store = Arc::new(InMemoryStore::new());
                for id in &local {
                    store.insert_order(&record(*id, "AAPL")).await.unwrap();
                }
                for symbol in SYMBOLS {
                    store.upsert_position(&local_position(symbol)).await.unwrap();
                }
                let snapshot = BrokerStateSnapshot {
                    orders: broker.iter().map(|id| open(*id, "AAPL")).collect(),
                    positions: positions
                        .iter()
                        .map(|(i, q)| position(SYMBOLS[*i], Decimal::from(*q)))
                        .collect(),
                    fetched_at: None,
                };
                reconciler(store.clone()).await.reconcile_with(&snapshot).await;

                let remaining: std::collections::BTreeSet<i64> = store
                    .list_open_orders()
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|o| o.order_id.0)
                    .collect();
                let expected: std::collections::BTreeSet<i64> =
                    local.intersection(&broker).copied().collect();
                prop_assert_eq!(remaining, expected);

                let held: std::collections::BTreeSet<String> = store
                    .list_positions()
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|p| p.symbol.to_string())
                    .collect();
                let nonzero: std::collections::BTreeSet<String> = positions
                    .iter()
                    .filter(|(_, q)| **q != 0)
                    .map(|(i, _)| SYMBOLS[*i].to_string())
                    .collect();
                prop_assert_eq!(held, nonzero);
                Ok(())
            })?;
        }
    }
}
