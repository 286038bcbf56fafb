//! In-process paper broker.
//!
//! Implements [`BrokerGateway`] without a network connection. Orders are
//! accepted with sequential order ids and permanent ids; fills, ticks, bars,
//! PnL and disconnects are driven explicitly by the caller. A fill on an OCA
//! member cancels its working siblings, as the real broker does.
//!
//! Failure injection covers connect failures, unknown symbols, order
//! rejection and added latency.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::broadcast;

use crate::broker::{AccountSummary, BrokerError, BrokerEvent, BrokerGateway, HistoricalBarsRequest};
use crate::domain::{
    Bar, BarEvent, BarSize, BrokerOrderStatus, BrokerPosition, Contract, FillEvent, OpenOrder,
    OrderAck, OrderId, OrderRequest, OrderSide, OrderStatusUpdate, PermId, PnlUpdate, Symbol,
    TickUpdate,
};

const PERM_ID_BASE: i64 = 900_000;
const ACCOUNT: &str = "DU0000001";

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    ack: OrderAck,
    status: BrokerOrderStatus,
    filled: Decimal,
}

impl PaperOrder {
    fn remaining(&self) -> Decimal {
        self.request.quantity - self.filled
    }

    fn status_update(&self) -> OrderStatusUpdate {
        OrderStatusUpdate {
            order_id: self.ack.order_id,
            perm_id: self.ack.perm_id,
            symbol: self.request.symbol().clone(),
            status: self.status,
            filled: self.filled,
            remaining: self.remaining(),
            avg_fill_price: None,
        }
    }
}

/// Paper broker gateway.
#[derive(Debug)]
pub struct PaperGateway {
    events: broadcast::Sender<BrokerEvent>,
    connected: AtomicBool,
    connect_calls: AtomicU32,
    failing_connects: AtomicU32,
    rejecting_orders: AtomicU32,
    next_order_id: AtomicI64,
    realtime_requests: AtomicU32,
    latency: Mutex<Duration>,
    unknown_symbols: Mutex<HashSet<Symbol>>,
    contract_ids: Mutex<HashMap<Symbol, i64>>,
    orders: Mutex<HashMap<OrderId, PaperOrder>>,
    positions: Mutex<HashMap<Symbol, BrokerPosition>>,
    history: Mutex<HashMap<Symbol, Vec<Bar>>>,
    last_fills: Mutex<HashMap<OrderId, FillEvent>>,
    net_liquidation: Mutex<Decimal>,
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperGateway {
    /// Create a disconnected paper gateway.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(4096);
        Self {
            events,
            connected: AtomicBool::new(false),
            connect_calls: AtomicU32::new(0),
            failing_connects: AtomicU32::new(0),
            rejecting_orders: AtomicU32::new(0),
            next_order_id: AtomicI64::new(1),
            realtime_requests: AtomicU32::new(0),
            latency: Mutex::new(Duration::ZERO),
            unknown_symbols: Mutex::new(HashSet::new()),
            contract_ids: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            last_fills: Mutex::new(HashMap::new()),
            net_liquidation: Mutex::new(dec!(100000)),
        }
    }

    // Failure injection

    /// Fail the next `n` connect calls.
    pub fn fail_next_connects(&self, n: u32) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` order placements.
    pub fn reject_next_orders(&self, n: u32) {
        self.rejecting_orders.store(n, Ordering::SeqCst);
    }

    /// Make qualification fail for `symbol`.
    pub fn mark_unknown(&self, symbol: impl Into<Symbol>) {
        self.unknown_symbols.lock().insert(symbol.into());
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    // Market simulation

    /// Drop the connection as if the network failed.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(BrokerEvent::Disconnected);
    }

    /// Push a quote.
    pub fn push_tick(&self, tick: TickUpdate) {
        self.emit(BrokerEvent::Tick(tick));
    }

    /// Push a closed realtime bar.
    pub fn push_bar(&self, symbol: impl Into<Symbol>, bar_size: BarSize, bar: Bar) {
        self.emit(BrokerEvent::BarClosed(BarEvent {
            symbol: symbol.into(),
            bar_size,
            bar,
        }));
    }

    /// Push an account PnL update.
    pub fn push_pnl(&self, daily_pnl: Decimal) {
        self.emit(BrokerEvent::Pnl(PnlUpdate {
            account: ACCOUNT.to_string(),
            daily_pnl,
            unrealized_pnl: None,
            realized_pnl: None,
        }));
    }

    /// Historical bars returned for `symbol`.
    pub fn set_history(&self, symbol: impl Into<Symbol>, bars: Vec<Bar>) {
        self.history.lock().insert(symbol.into(), bars);
    }

    /// Overwrite a position, as if changed outside the engine.
    pub fn set_position(&self, symbol: impl Into<Symbol>, quantity: Decimal, avg_cost: Decimal) {
        let symbol = symbol.into();
        let mut positions = self.positions.lock();
        if quantity.is_zero() {
            positions.remove(&symbol);
        } else {
            positions.insert(
                symbol.clone(),
                BrokerPosition {
                    account: ACCOUNT.to_string(),
                    symbol,
                    quantity,
                    avg_cost,
                },
            );
        }
    }

    /// Net liquidation reported by the account summary.
    pub fn set_net_liquidation(&self, value: Decimal) {
        *self.net_liquidation.lock() = value;
    }

    /// Add a working order that the engine did not place.
    pub fn inject_open_order(&self, request: OrderRequest) -> OrderAck {
        self.accept(request)
    }

    /// Fill the remaining quantity of an order at `price`.
    pub fn fill_order(&self, order_id: OrderId, price: Decimal) -> Option<FillEvent> {
        let remaining = self.orders.lock().get(&order_id)?.remaining();
        self.fill_partial(order_id, remaining, price)
    }

    /// Fill `shares` of an order at `price`.
    pub fn fill_partial(&self, order_id: OrderId, shares: Decimal, price: Decimal) -> Option<FillEvent> {
        let (fill, status, siblings) = {
            let mut orders = self.orders.lock();
            let order = orders.get_mut(&order_id)?;
            if order.status.is_terminal() || shares <= Decimal::ZERO {
                return None;
            }
            let shares = shares.min(order.remaining());
            order.filled += shares;
            if order.remaining().is_zero() {
                order.status = BrokerOrderStatus::Filled;
            }
            let fill = FillEvent {
                exec_id: format!("exec-{}-{}", order_id, order.filled),
                order_id,
                perm_id: order.ack.perm_id,
                symbol: order.request.symbol().clone(),
                side: order.request.side,
                shares,
                price,
                time: Utc::now(),
            };
            let status = order.status_update();
            let oca = order.request.oca_group.clone();

            let mut siblings = Vec::new();
            if let Some(group) = oca {
                for other in orders.values_mut() {
                    if other.ack.order_id != order_id
                        && other.request.oca_group.as_deref() == Some(group.as_str())
                        && !other.status.is_terminal()
                    {
                        other.status = BrokerOrderStatus::Cancelled;
                        siblings.push(other.status_update());
                    }
                }
            }
            (fill, status, siblings)
        };

        self.apply_fill_to_position(&fill);
        self.last_fills.lock().insert(order_id, fill.clone());
        self.emit(BrokerEvent::OrderStatus(status));
        self.emit(BrokerEvent::Fill(fill.clone()));
        for sibling in siblings {
            self.emit(BrokerEvent::OrderStatus(sibling));
        }
        Some(fill)
    }

    /// Move an order to `status` and publish the update, as when the broker
    /// deactivates or expires it.
    pub fn set_order_status(
        &self,
        order_id: OrderId,
        status: BrokerOrderStatus,
    ) -> Option<OrderStatusUpdate> {
        let update = {
            let mut orders = self.orders.lock();
            let order = orders.get_mut(&order_id)?;
            order.status = status;
            order.status_update()
        };
        self.emit(BrokerEvent::OrderStatus(update.clone()));
        Some(update)
    }

    /// Deliver the last fill of an order again.
    pub fn redeliver_fill(&self, order_id: OrderId) -> bool {
        let fill = self.last_fills.lock().get(&order_id).cloned();
        fill.is_some_and(|fill| {
            self.emit(BrokerEvent::Fill(fill));
            true
        })
    }

    // Inspection

    /// Number of `connect` calls.
    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of realtime bar subscription requests.
    pub fn realtime_subscription_requests(&self) -> u32 {
        self.realtime_requests.load(Ordering::SeqCst)
    }

    /// Every order placed, in id order.
    pub fn placed_orders(&self) -> Vec<(OrderAck, OrderRequest, BrokerOrderStatus)> {
        let orders = self.orders.lock();
        let mut all: Vec<_> = orders
            .values()
            .map(|o| (o.ack, o.request.clone(), o.status))
            .collect();
        all.sort_by_key(|(ack, _, _)| ack.order_id);
        all
    }

    /// Orders for `symbol` tagged with an OCA group.
    pub fn oca_orders(&self, symbol: &Symbol) -> Vec<(OrderAck, OrderRequest, BrokerOrderStatus)> {
        self.placed_orders()
            .into_iter()
            .filter(|(_, r, _)| r.symbol() == symbol && r.oca_group.is_some())
            .collect()
    }

    /// Orders for `symbol` with the given tag.
    pub fn orders_with_ref(
        &self,
        symbol: &Symbol,
        order_ref: &str,
    ) -> Vec<(OrderAck, OrderRequest, BrokerOrderStatus)> {
        self.placed_orders()
            .into_iter()
            .filter(|(_, r, _)| r.symbol() == symbol && r.order_ref.as_deref() == Some(order_ref))
            .collect()
    }

    /// Status of one order.
    pub fn order_status(&self, order_id: OrderId) -> Option<BrokerOrderStatus> {
        self.orders.lock().get(&order_id).map(|o| o.status)
    }

    /// Current position for `symbol`.
    pub fn position(&self, symbol: &Symbol) -> Decimal {
        self.positions
            .lock()
            .get(symbol)
            .map_or(Decimal::ZERO, |p| p.quantity)
    }

    fn emit(&self, event: BrokerEvent) {
        let _ = self.events.send(event);
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    fn accept(&self, request: OrderRequest) -> OrderAck {
        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        let ack = OrderAck {
            order_id: OrderId(id),
            perm_id: PermId(PERM_ID_BASE + id),
        };
        let order = PaperOrder {
            request,
            ack,
            status: BrokerOrderStatus::Submitted,
            filled: Decimal::ZERO,
        };
        let update = order.status_update();
        self.orders.lock().insert(ack.order_id, order);
        self.emit(BrokerEvent::OrderStatus(update));
        ack
    }

    fn apply_fill_to_position(&self, fill: &FillEvent) {
        let signed = match fill.side {
            OrderSide::Buy => fill.shares,
            OrderSide::Sell => -fill.shares,
        };
        let mut positions = self.positions.lock();
        let entry = positions
            .entry(fill.symbol.clone())
            .or_insert_with(|| BrokerPosition {
                account: ACCOUNT.to_string(),
                symbol: fill.symbol.clone(),
                quantity: Decimal::ZERO,
                avg_cost: fill.price,
            });
        let before = entry.quantity;
        entry.quantity += signed;
        if before.is_zero() || before.is_sign_negative() == signed.is_sign_negative() {
            let total = before.abs() + fill.shares;
            if !total.is_zero() {
                entry.avg_cost = (entry.avg_cost * before.abs() + fill.price * fill.shares) / total;
            }
        }
        let position = entry.clone();
        if position.quantity.is_zero() {
            positions.remove(&fill.symbol);
        }
        drop(positions);
        self.emit(BrokerEvent::Position(position));
    }
}

#[async_trait]
impl BrokerGateway for PaperGateway {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(BrokerError::ConnectionFailed(
                "paper gateway refused connection".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    async fn qualify_contract(&self, contract: &Contract) -> Result<Contract, BrokerError> {
        self.simulate_latency().await;
        self.ensure_connected()?;
        if self.unknown_symbols.lock().contains(&contract.symbol) {
            return Err(BrokerError::QualificationFailed {
                symbol: contract.symbol.to_string(),
                message: "no security definition has been found".to_string(),
            });
        }
        let mut ids = self.contract_ids.lock();
        let next = i64::try_from(ids.len()).unwrap_or(i64::MAX).saturating_add(1_000);
        let con_id = *ids.entry(contract.symbol.clone()).or_insert(next);
        Ok(contract.qualified(con_id))
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, BrokerError> {
        self.simulate_latency().await;
        self.ensure_connected()?;
        let rejecting = self.rejecting_orders.load(Ordering::SeqCst);
        if rejecting > 0 {
            self.rejecting_orders.store(rejecting - 1, Ordering::SeqCst);
            return Err(BrokerError::OrderRejected(format!(
                "paper gateway rejected {} {}",
                order.side,
                order.symbol()
            )));
        }
        if order.quantity <= Decimal::ZERO {
            return Err(BrokerError::OrderRejected("quantity must be positive".to_string()));
        }
        Ok(self.accept(order.clone()))
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<(), BrokerError> {
        self.simulate_latency().await;
        self.ensure_connected()?;
        let update = {
            let mut orders = self.orders.lock();
            let order = orders
                .get_mut(&order_id)
                .ok_or(BrokerError::OrderNotFound(order_id))?;
            if order.status.is_terminal() {
                return Ok(());
            }
            order.status = BrokerOrderStatus::ApiCancelled;
            order.status_update()
        };
        self.emit(BrokerEvent::OrderStatus(update));
        Ok(())
    }

    async fn request_historical_bars(
        &self,
        request: &HistoricalBarsRequest,
    ) -> Result<Vec<Bar>, BrokerError> {
        self.simulate_latency().await;
        self.ensure_connected()?;
        Ok(self
            .history
            .lock()
            .get(&request.contract.symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn request_realtime_bars(
        &self,
        _contract: &Contract,
        _bar_size: BarSize,
    ) -> Result<(), BrokerError> {
        self.simulate_latency().await;
        self.ensure_connected()?;
        self.realtime_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn request_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.simulate_latency().await;
        self.ensure_connected()?;
        Ok(self.positions.lock().values().cloned().collect())
    }

    async fn request_open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError> {
        self.simulate_latency().await;
        self.ensure_connected()?;
        Ok(self
            .orders
            .lock()
            .values()
            .filter(|o| !o.status.is_terminal())
            .map(|o| OpenOrder {
                order_id: o.ack.order_id,
                perm_id: o.ack.perm_id,
                symbol: o.request.symbol().clone(),
                side: o.request.side,
                order_type: o.request.order_type,
                quantity: o.remaining(),
                oca_group: o.request.oca_group.clone(),
                order_ref: o.request.order_ref.clone(),
                status: o.status,
            })
            .collect())
    }

    async fn request_pnl(&self, _account: &str) -> Result<(), BrokerError> {
        self.simulate_latency().await;
        self.ensure_connected()
    }

    async fn request_account_summary(&self) -> Result<AccountSummary, BrokerError> {
        self.simulate_latency().await;
        self.ensure_connected()?;
        let net = *self.net_liquidation.lock();
        Ok(AccountSummary {
            account: ACCOUNT.to_string(),
            net_liquidation: net,
            available_funds: net,
            buying_power: net * dec!(4),
        })
    }
}
