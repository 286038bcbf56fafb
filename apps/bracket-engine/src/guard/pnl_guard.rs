//! Daily loss kill switch.
//!
//! Every PnL update refreshes the [`RiskSession`]. While daily PnL is at or
//! below the threshold, each evaluation flattens every open position that
//! does not already have an exit working, and cancels bracket children left
//! behind on symbols that are already flat. Symbols are handled concurrently
//! and independently.
//!
//! An exit is working when the broker lists a live guard close for the
//! symbol, or any live order outside an OCA group on the side that reduces
//! the position.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join, join_all};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::market_hours::{Clock, is_regular_trading_hours};
use crate::broker::{BrokerSession, SessionError};
use crate::config::RiskConfig;
use crate::domain::{
    BrokerPosition, Contract, MarketSnapshot, OpenOrder, OrderId, OrderRecord, OrderRequest,
    OrderRole, OrderSide, OrderStatusUpdate, PnlUpdate, RiskSession, Symbol, TimeInForce,
};
use crate::execution::pricing::{round_price, to_price};
use crate::market_data::MarketDataCache;
use crate::observability;
use crate::persistence::DurableStore;

/// Order tag on every guard close.
pub const GUARD_ORDER_REF: &str = "pnl-guard";

/// Guard failure.
#[derive(Debug, Clone, Error)]
pub enum GuardError {
    /// Broker request failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// No quote, mark, last or bar close to price an after-hours close.
    #[error("no close price available for {0}")]
    NoClosePrice(Symbol),
}

/// What one evaluation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardReport {
    /// Daily PnL at evaluation time.
    pub daily_pnl: Decimal,
    /// Close orders sent.
    pub closes_submitted: Vec<(Symbol, OrderId)>,
    /// Symbols skipped because a close is already working.
    pub already_pending: Vec<Symbol>,
    /// Orphaned bracket children cancelled.
    pub orphans_cancelled: Vec<OrderId>,
    /// Per-symbol failures. Other symbols were still processed.
    pub errors: Vec<(Symbol, String)>,
}

impl GuardReport {
    /// Every symbol was handled without error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone)]
struct PendingClose {
    order_id: Option<OrderId>,
    since: DateTime<Utc>,
}

/// PnL guard.
pub struct PnlGuard {
    session: Arc<BrokerSession>,
    cache: Arc<MarketDataCache>,
    store: Arc<dyn DurableStore>,
    config: RiskConfig,
    clock: Arc<dyn Clock>,
    risk: RwLock<RiskSession>,
    tripped: AtomicBool,
    pending: Mutex<HashMap<Symbol, PendingClose>>,
}

impl std::fmt::Debug for PnlGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PnlGuard")
            .field("risk", &*self.risk.read())
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl PnlGuard {
    /// Create a guard with no PnL seen yet.
    #[must_use]
    pub fn new(
        session: Arc<BrokerSession>,
        cache: Arc<MarketDataCache>,
        store: Arc<dyn DurableStore>,
        config: RiskConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let risk = RiskSession::new(config.account_id.clone(), config.daily_loss_threshold);
        Self {
            session,
            cache,
            store,
            config,
            clock,
            risk: RwLock::new(risk),
            tripped: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Current risk session.
    #[must_use]
    pub fn risk_session(&self) -> RiskSession {
        self.risk.read().clone()
    }

    /// Whether the loss threshold is breached.
    #[must_use]
    pub fn is_breached(&self) -> bool {
        self.risk.read().is_breached()
    }

    /// Symbols with a close in flight.
    #[must_use]
    pub fn pending_closes(&self) -> Vec<Symbol> {
        let mut symbols: Vec<_> = self.pending.lock().keys().cloned().collect();
        symbols.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        symbols
    }

    /// Apply a PnL update and liquidate if breached.
    ///
    /// Returns the evaluation report when the threshold is breached.
    ///
    /// # Errors
    ///
    /// The broker error if positions or open orders could not be fetched.
    pub async fn on_pnl_update(&self, update: &PnlUpdate) -> Result<Option<GuardReport>, GuardError> {
        let risk = {
            let mut risk = self.risk.write();
            risk.apply(update);
            risk.clone()
        };
        observability::record_daily_pnl(risk.daily_pnl);

        let breached = risk.is_breached();
        let was_breached = self.tripped.swap(breached, Ordering::SeqCst);
        if breached && !was_breached {
            warn!(
                account = %risk.account_id,
                daily_pnl = %risk.daily_pnl,
                threshold = %risk.threshold,
                "Daily loss threshold breached, liquidating"
            );
        } else if !breached && was_breached {
            info!(daily_pnl = %risk.daily_pnl, "Daily PnL back above threshold");
        }
        if !breached {
            return Ok(None);
        }
        self.evaluate().await.map(Some)
    }

    /// Flatten every unaddressed position and clean up orphaned children.
    ///
    /// # Errors
    ///
    /// The broker error if positions or open orders could not be fetched.
    /// Per-symbol failures are reported in [`GuardReport::errors`].
    pub async fn evaluate(&self) -> Result<GuardReport, GuardError> {
        let daily_pnl = self.risk.read().daily_pnl;
        let positions: Vec<BrokerPosition> = self
            .session
            .request_positions()
            .await?
            .into_iter()
            .filter(|p| !p.quantity.is_zero())
            .collect();
        let open_orders = self.session.request_open_orders().await?;
        let rth = is_regular_trading_hours(self.clock.now());

        let mut orders_by_symbol: HashMap<Symbol, Vec<OpenOrder>> = HashMap::new();
        for order in open_orders {
            orders_by_symbol
                .entry(order.symbol.clone())
                .or_default()
                .push(order);
        }
        self.adopt_working_exits(&orders_by_symbol, &positions);

        let mut report = GuardReport {
            daily_pnl,
            ..GuardReport::default()
        };
        let mut held = HashSet::new();
        let mut closes = Vec::new();
        for position in positions {
            held.insert(position.symbol.clone());
            if !self.claim(&position.symbol) {
                debug!(symbol = %position.symbol, "Close already pending");
                report.already_pending.push(position.symbol);
                continue;
            }
            let children: Vec<OpenOrder> = orders_by_symbol
                .get(&position.symbol)
                .map(|orders| {
                    orders
                        .iter()
                        .filter(|o| o.oca_group.is_some())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            closes.push(async move {
                let symbol = position.symbol.clone();
                let result = self.close_position(position, children, rth).await;
                (symbol, result)
            });
        }

        let orphans: Vec<(Symbol, OrderId)> = orders_by_symbol
            .iter()
            .filter(|(symbol, _)| !held.contains(*symbol))
            .flat_map(|(symbol, orders)| {
                orders
                    .iter()
                    .filter(|o| o.oca_group.is_some())
                    .map(|o| (symbol.clone(), o.order_id))
            })
            .collect();
        let cancels = orphans.into_iter().map(|(symbol, order_id)| async move {
            let result = self.session.cancel_order(order_id).await;
            (symbol, order_id, result)
        });

        let (closed, cancelled) = join(join_all(closes), join_all(cancels)).await;
        for (symbol, result) in closed {
            match result {
                Ok(order_id) => {
                    if let Some(pending) = self.pending.lock().get_mut(&symbol) {
                        pending.order_id = Some(order_id);
                    }
                    report.closes_submitted.push((symbol, order_id));
                }
                Err(err) => {
                    self.pending.lock().remove(&symbol);
                    error!(symbol = %symbol, error = %err, "Failed to close position");
                    report.errors.push((symbol, err.to_string()));
                }
            }
        }
        for (symbol, order_id, result) in cancelled {
            match result {
                Ok(()) => {
                    info!(symbol = %symbol, order_id = %order_id, "Cancelled orphaned bracket child");
                    report.orphans_cancelled.push(order_id);
                }
                Err(err) => {
                    warn!(symbol = %symbol, order_id = %order_id, error = %err, "Failed to cancel orphaned child");
                    report.errors.push((symbol, err.to_string()));
                }
            }
        }

        info!(
            daily_pnl = %report.daily_pnl,
            closes = report.closes_submitted.len(),
            pending = report.already_pending.len(),
            orphans = report.orphans_cancelled.len(),
            errors = report.errors.len(),
            "Guard evaluation complete"
        );
        Ok(report)
    }

    /// Release a symbol's pending close once its order is done.
    pub fn on_order_status(&self, update: &OrderStatusUpdate) {
        if !update.status.is_terminal() {
            return;
        }
        let mut pending = self.pending.lock();
        let ours = pending
            .get(&update.symbol)
            .is_some_and(|p| p.order_id == Some(update.order_id));
        if ours {
            if let Some(close) = pending.remove(&update.symbol) {
                info!(
                    symbol = %update.symbol,
                    order_id = %update.order_id,
                    status = ?update.status,
                    since = %close.since,
                    "Guard close finished"
                );
            }
        }
    }

    /// Release a symbol's pending close once the broker shows it flat.
    pub fn on_position(&self, position: &BrokerPosition) {
        if position.quantity.is_zero() && self.pending.lock().remove(&position.symbol).is_some() {
            info!(symbol = %position.symbol, "Position flat, pending close released");
        }
    }

    /// Re-evaluate on a fixed cadence while breached, until `shutdown`.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.guard_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.is_breached() {
                        continue;
                    }
                    if let Err(err) = self.evaluate().await {
                        warn!(error = %err, "Periodic guard evaluation failed");
                    }
                }
            }
        }
        debug!("PnL guard loop stopped");
    }

    fn claim(&self, symbol: &Symbol) -> bool {
        match self.pending.lock().entry(symbol.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(PendingClose {
                    order_id: None,
                    since: self.clock.now(),
                });
                true
            }
        }
    }

    fn adopt_working_exits(
        &self,
        orders_by_symbol: &HashMap<Symbol, Vec<OpenOrder>>,
        positions: &[BrokerPosition],
    ) {
        let mut pending = self.pending.lock();
        for (symbol, orders) in orders_by_symbol {
            let position = positions.iter().find(|p| &p.symbol == symbol);
            let Some(order) = orders.iter().find(|o| addresses_position(o, position)) else {
                continue;
            };
            if let Entry::Vacant(slot) = pending.entry(symbol.clone()) {
                debug!(
                    symbol = %symbol,
                    order_id = %order.order_id,
                    order_ref = ?order.order_ref,
                    "Working exit found at broker"
                );
                slot.insert(PendingClose {
                    order_id: Some(order.order_id),
                    since: self.clock.now(),
                });
            }
        }
    }

    async fn close_position(
        &self,
        position: BrokerPosition,
        children: Vec<OpenOrder>,
        rth: bool,
    ) -> Result<OrderId, GuardError> {
        let symbol = position.symbol.clone();
        for child in &children {
            if let Err(err) = self.session.cancel_order(child.order_id).await {
                warn!(symbol = %symbol, order_id = %child.order_id, error = %err, "Failed to cancel bracket child before close");
            }
        }

        let contract = self
            .cache
            .qualify(&self.session, &Contract::stock(symbol.clone()))
            .await?;
        let side = OrderSide::closing(position.quantity);
        let quantity = position.quantity.abs();
        let request = if rth {
            OrderRequest::market(contract, side, quantity)
        } else {
            let snapshot = self.cache.get_snapshot(&symbol);
            let bar_close = self.cache.last_close(&symbol, self.cache.config().bar_size);
            let price = close_limit_price(
                snapshot.as_deref(),
                bar_close,
                side,
                self.config.close_limit_offset_pct,
            )
            .ok_or_else(|| GuardError::NoClosePrice(symbol.clone()))?;
            OrderRequest::limit(contract, side, quantity, price)
                .with_tif(TimeInForce::Day)
                .outside_rth(true)
        }
        .with_ref(GUARD_ORDER_REF);

        let ack = self.session.place_order(&request).await?;
        observability::record_liquidation_order(symbol.as_str());
        info!(
            symbol = %symbol,
            order_id = %ack.order_id,
            side = %side,
            quantity = %quantity,
            price = ?request.price(),
            "Guard close submitted"
        );
        let record = OrderRecord::placed(&request, ack, OrderRole::Liquidation);
        if let Err(err) = self.store.insert_order(&record).await {
            warn!(symbol = %symbol, order_id = %ack.order_id, error = %err, "Failed to store guard close");
        }
        Ok(ack.order_id)
    }
}

/// Whether a live order already works the position down.
///
/// Guard closes always count. Other orders count when they are outside an
/// OCA group and on the reducing side of a nonzero position.
fn addresses_position(order: &OpenOrder, position: Option<&BrokerPosition>) -> bool {
    if order.status.is_terminal() {
        return false;
    }
    if order.order_ref.as_deref() == Some(GUARD_ORDER_REF) {
        return true;
    }
    order.oca_group.is_none()
        && position.is_some_and(|p| {
            !p.quantity.is_zero() && order.side == OrderSide::closing(p.quantity)
        })
}

/// Limit price for an after-hours close.
///
/// Selling (closing a long) starts from bid, buying (closing a short) from
/// ask, then mark, last and the newest bar close. The price is moved
/// `offset_pct` percent toward the other side and rounded to cents.
#[must_use]
pub fn close_limit_price(
    snapshot: Option<&MarketSnapshot>,
    bar_close: Option<f64>,
    side: OrderSide,
    offset_pct: Decimal,
) -> Option<Decimal> {
    let quoted = snapshot.and_then(|s| {
        let touch = match side {
            OrderSide::Sell => s.bid,
            OrderSide::Buy => s.ask,
        };
        [touch, s.mark, s.last].into_iter().flatten().find_map(to_price)
    });
    let base = quoted.or_else(|| bar_close.and_then(to_price))?;
    let offset = offset_pct / dec!(100);
    let price = match side {
        OrderSide::Sell => base * (Decimal::ONE - offset),
        OrderSide::Buy => base * (Decimal::ONE + offset),
    };
    Some(round_price(price))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SessionSettings;
    use crate::config::IndicatorsConfig;
    use crate::domain::{BrokerOrderStatus, TickUpdate};
    use crate::guard::FixedClock;
    use crate::paper::PaperGateway;
    use crate::persistence::InMemoryStore;
    use chrono::TimeZone;

    struct Harness {
        paper: Arc<PaperGateway>,
        cache: Arc<MarketDataCache>,
        clock: Arc<FixedClock>,
        guard: PnlGuard,
    }

    fn market_open() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 15, 0, 0).unwrap()
    }

    fn after_hours() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 23, 0, 0).unwrap()
    }

    async fn harness() -> Harness {
        let paper = Arc::new(PaperGateway::new());
        let session = BrokerSession::new(
            paper.clone(),
            SessionSettings {
                connect_attempts: 1,
                connect_retry_delay: Duration::ZERO,
                reconnect_delay: Duration::from_millis(10),
                request_timeout: Duration::from_secs(1),
            },
        );
        session.connect().await.unwrap();
        let cache = Arc::new(MarketDataCache::new(IndicatorsConfig::default()));
        let clock = Arc::new(FixedClock::new(market_open()));
        let guard = PnlGuard::new(
            session,
            cache.clone(),
            Arc::new(InMemoryStore::new()),
            RiskConfig {
                daily_loss_threshold: dec!(-1000),
                ..RiskConfig::default()
            },
            clock.clone(),
        );
        Harness {
            paper,
            cache,
            clock,
            guard,
        }
    }

    fn pnl(daily: Decimal) -> PnlUpdate {
        PnlUpdate {
            account: "DU0000001".to_string(),
            daily_pnl: daily,
            unrealized_pnl: None,
            realized_pnl: None,
        }
    }

    fn closes(h: &Harness, symbol: &str) -> usize {
        h.paper
            .orders_with_ref(&Symbol::new(symbol), GUARD_ORDER_REF)
            .len()
    }

    #[tokio::test]
    async fn no_breach_no_orders() {
        let h = harness().await;
        h.paper.set_position("AAPL", dec!(10), dec!(100));
        assert!(h.guard.on_pnl_update(&pnl(dec!(-999.99))).await.unwrap().is_none());
        assert!(h.paper.placed_orders().is_empty());
        assert!(!h.guard.is_breached());
    }

    #[tokio::test]
    async fn breach_closes_every_position_with_market_orders() {
        let h = harness().await;
        h.paper.set_position("AAPL", dec!(10), dec!(100));
        h.paper.set_position("MSFT", dec!(-5), dec!(300));

        let report = h.guard.on_pnl_update(&pnl(dec!(-1000))).await.unwrap().unwrap();
        assert_eq!(report.closes_submitted.len(), 2);
        assert!(report.is_clean());

        let aapl = h.paper.orders_with_ref(&Symbol::new("AAPL"), GUARD_ORDER_REF);
        assert_eq!(aapl[0].1.side, OrderSide::Sell);
        assert_eq!(aapl[0].1.quantity, dec!(10));
        assert_eq!(aapl[0].1.order_type, crate::domain::OrderType::Market);
        let msft = h.paper.orders_with_ref(&Symbol::new("MSFT"), GUARD_ORDER_REF);
        assert_eq!(msft[0].1.side, OrderSide::Buy);
        assert_eq!(msft[0].1.quantity, dec!(5));
        assert_eq!(h.guard.pending_closes().len(), 2);
    }

    #[tokio::test]
    async fn repeated_breach_does_not_double_submit() {
        let h = harness().await;
        h.paper.set_position("AAPL", dec!(10), dec!(100));
        h.guard.on_pnl_update(&pnl(dec!(-1500))).await.unwrap();
        let second = h.guard.on_pnl_update(&pnl(dec!(-1600))).await.unwrap().unwrap();
        assert_eq!(second.already_pending, vec![Symbol::new("AAPL")]);
        assert_eq!(closes(&h, "AAPL"), 1);
    }

    #[tokio::test]
    async fn working_guard_order_at_broker_counts_as_pending() {
        let h = harness().await;
        h.paper.set_position("AAPL", dec!(10), dec!(100));
        let contract = Contract::stock("AAPL").qualified(1);
        h.paper.inject_open_order(
            OrderRequest::market(contract, OrderSide::Sell, dec!(10)).with_ref(GUARD_ORDER_REF),
        );
        let report = h.guard.on_pnl_update(&pnl(dec!(-2000))).await.unwrap().unwrap();
        assert!(report.closes_submitted.is_empty());
        assert_eq!(closes(&h, "AAPL"), 1);
    }

    #[tokio::test]
    async fn working_exit_from_elsewhere_counts_as_pending() {
        let h = harness().await;
        h.paper.set_position("AAPL", dec!(10), dec!(100));
        let contract = Contract::stock("AAPL").qualified(1);
        h.paper.inject_open_order(
            OrderRequest::limit(contract, OrderSide::Sell, dec!(10), dec!(99)).with_ref("manual-exit"),
        );

        let report = h.guard.on_pnl_update(&pnl(dec!(-2000))).await.unwrap().unwrap();
        assert!(report.closes_submitted.is_empty());
        assert_eq!(report.already_pending, vec![Symbol::new("AAPL")]);
        let sells = h
            .paper
            .placed_orders()
            .into_iter()
            .filter(|(_, r, _)| r.side == OrderSide::Sell)
            .count();
        assert_eq!(sells, 1);
    }

    #[tokio::test]
    async fn same_side_order_does_not_block_close() {
        let h = harness().await;
        h.paper.set_position("MSFT", dec!(5), dec!(300));
        let contract = Contract::stock("MSFT").qualified(2);
        h.paper.inject_open_order(
            OrderRequest::limit(contract, OrderSide::Buy, dec!(5), dec!(290)).with_ref("entry:other"),
        );

        let report = h.guard.on_pnl_update(&pnl(dec!(-2000))).await.unwrap().unwrap();
        assert_eq!(report.closes_submitted.len(), 1);
        assert_eq!(closes(&h, "MSFT"), 1);
    }

    #[test]
    fn only_live_reducing_orders_address_a_position() {
        let position = BrokerPosition {
            account: "DU0000001".to_string(),
            symbol: Symbol::new("AAPL"),
            quantity: dec!(-4),
            avg_cost: dec!(100),
        };
        let order = OpenOrder {
            order_id: OrderId(1),
            perm_id: crate::domain::PermId(1),
            symbol: Symbol::new("AAPL"),
            side: OrderSide::Buy,
            order_type: crate::domain::OrderType::Market,
            quantity: dec!(4),
            oca_group: None,
            order_ref: None,
            status: BrokerOrderStatus::Submitted,
        };
        assert!(addresses_position(&order, Some(&position)));
        assert!(!addresses_position(&order, None));

        let bracket_child = OpenOrder {
            oca_group: Some("g".to_string()),
            ..order.clone()
        };
        assert!(!addresses_position(&bracket_child, Some(&position)));

        let done = OpenOrder {
            status: BrokerOrderStatus::Cancelled,
            ..order.clone()
        };
        assert!(!addresses_position(&done, Some(&position)));

        let guard_close = OpenOrder {
            side: OrderSide::Sell,
            order_ref: Some(GUARD_ORDER_REF.to_string()),
            ..order
        };
        assert!(addresses_position(&guard_close, None));
    }

    #[tokio::test]
    async fn after_hours_uses_offset_limit() {
        let h = harness().await;
        h.clock.set(after_hours());
        h.paper.set_position("AAPL", dec!(10), dec!(100));
        h.paper.set_position("MSFT", dec!(-5), dec!(300));
        let mut tick = TickUpdate::new("AAPL");
        tick.bid = Some(99.50);
        h.cache.on_tick(&tick);
        let mut tick = TickUpdate::new("MSFT");
        tick.ask = Some(300.0);
        h.cache.on_tick(&tick);

        h.guard.on_pnl_update(&pnl(dec!(-1200))).await.unwrap();
        let aapl = h.paper.orders_with_ref(&Symbol::new("AAPL"), GUARD_ORDER_REF);
        assert_eq!(aapl[0].1.limit_price, Some(dec!(99.40)));
        assert!(aapl[0].1.outside_rth);
        let msft = h.paper.orders_with_ref(&Symbol::new("MSFT"), GUARD_ORDER_REF);
        assert_eq!(msft[0].1.limit_price, Some(dec!(300.30)));
    }

    #[tokio::test]
    async fn after_hours_without_price_reports_and_retries() {
        let h = harness().await;
        h.clock.set(after_hours());
        h.paper.set_position("AAPL", dec!(10), dec!(100));
        let report = h.guard.on_pnl_update(&pnl(dec!(-1200))).await.unwrap().unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(h.guard.pending_closes().is_empty());

        let mut tick = TickUpdate::new("AAPL");
        tick.last = Some(101.0);
        h.cache.on_tick(&tick);
        let report = h.guard.evaluate().await.unwrap();
        assert_eq!(report.closes_submitted.len(), 1);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_others() {
        let h = harness().await;
        h.paper.set_position("AAPL", dec!(10), dec!(100));
        h.paper.set_position("MSFT", dec!(7), dec!(300));
        h.paper.reject_next_orders(1);

        let report = h.guard.on_pnl_update(&pnl(dec!(-1500))).await.unwrap().unwrap();
        assert_eq!(report.closes_submitted.len(), 1);
        assert_eq!(report.errors.len(), 1);

        let retry = h.guard.evaluate().await.unwrap();
        assert_eq!(retry.closes_submitted.len(), 1);
        assert_eq!(retry.already_pending.len(), 1);
        assert_eq!(closes(&h, "AAPL") + closes(&h, "MSFT"), 2);
    }

    #[tokio::test]
    async fn flat_symbol_children_are_cancelled() {
        let h = harness().await;
        let contract = Contract::stock("TSLA").qualified(7);
        let tp = h.paper.inject_open_order(
            OrderRequest::limit(contract.clone(), OrderSide::Sell, dec!(3), dec!(250)).with_oca("g"),
        );
        let sl = h.paper.inject_open_order(
            OrderRequest::stop(contract, OrderSide::Sell, dec!(3), dec!(240)).with_oca("g"),
        );

        let report = h.guard.on_pnl_update(&pnl(dec!(-1500))).await.unwrap().unwrap();
        assert_eq!(report.orphans_cancelled.len(), 2);
        assert_eq!(h.paper.order_status(tp.order_id), Some(BrokerOrderStatus::ApiCancelled));
        assert_eq!(h.paper.order_status(sl.order_id), Some(BrokerOrderStatus::ApiCancelled));
        assert!(h.paper.orders_with_ref(&Symbol::new("TSLA"), GUARD_ORDER_REF).is_empty());
    }

    #[tokio::test]
    async fn held_symbol_children_are_cancelled_before_close() {
        let h = harness().await;
        h.paper.set_position("AAPL", dec!(10), dec!(100));
        let contract = Contract::stock("AAPL").qualified(1);
        let sl = h.paper.inject_open_order(
            OrderRequest::stop(contract, OrderSide::Sell, dec!(10), dec!(98)).with_oca("g"),
        );
        h.guard.on_pnl_update(&pnl(dec!(-1500))).await.unwrap();
        assert_eq!(h.paper.order_status(sl.order_id), Some(BrokerOrderStatus::ApiCancelled));
        assert_eq!(closes(&h, "AAPL"), 1);
    }

    #[tokio::test]
    async fn terminal_close_status_releases_pending() {
        let h = harness().await;
        h.paper.set_position("AAPL", dec!(10), dec!(100));
        let report = h.guard.on_pnl_update(&pnl(dec!(-1500))).await.unwrap().unwrap();
        let (_, order_id) = report.closes_submitted[0].clone();

        let inactive = h
            .paper
            .set_order_status(order_id, BrokerOrderStatus::Inactive)
            .unwrap();
        h.guard.on_order_status(&inactive);
        assert!(h.guard.pending_closes().is_empty());

        h.guard.evaluate().await.unwrap();
        assert_eq!(closes(&h, "AAPL"), 2);
    }

    #[tokio::test]
    async fn flat_position_releases_pending() {
        let h = harness().await;
        h.paper.set_position("AAPL", dec!(10), dec!(100));
        h.guard.on_pnl_update(&pnl(dec!(-1500))).await.unwrap();
        h.guard.on_position(&BrokerPosition {
            account: "DU0000001".to_string(),
            symbol: Symbol::new("AAPL"),
            quantity: Decimal::ZERO,
            avg_cost: Decimal::ZERO,
        });
        assert!(h.guard.pending_closes().is_empty());
    }

    #[test]
    fn close_price_falls_back_through_mark_and_last() {
        let mut snapshot = MarketSnapshot::empty(Symbol::new("AAPL"));
        snapshot.mark = Some(50.0);
        snapshot.last = Some(49.0);
        assert_eq!(
            close_limit_price(Some(&snapshot), None, OrderSide::Sell, Decimal::ZERO),
            Some(dec!(50.00))
        );
        snapshot.mark = None;
        assert_eq!(
            close_limit_price(Some(&snapshot), None, OrderSide::Buy, Decimal::ZERO),
            Some(dec!(49.00))
        );
        assert_eq!(
            close_limit_price(None, Some(48.0), OrderSide::Buy, dec!(1)),
            Some(dec!(48.48))
        );
        assert_eq!(close_limit_price(None, None, OrderSide::Sell, dec!(1)), None);
    }
}
