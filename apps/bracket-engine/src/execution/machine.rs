//! Bracket Order State Machine
//!
//! Owns every bracket from parent submission to a terminal state:
//!
//! 1. Price and size the intent ([`BracketMachine::plan`]).
//! 2. Send the parent and track it by session order id.
//! 3. When the parent is completely filled, confirm the position with the
//!    broker and place a take-profit limit and a stop-loss stop in one OCA
//!    group, sized to the confirmed position.
//! 4. Follow child statuses until one fills or both are dead.
//!
//! Step 3 runs at most once per parent permanent id, no matter how many
//! times the broker reports the fill or how many handlers see it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dedup::{ClosedBrackets, FillDedup};
use super::outcome::{FillOutcome, IntentOutcome, TradePlan};
use super::pricing;
use crate::broker::{BrokerSession, SessionError};
use crate::config::ExecutionConfig;
use crate::domain::{
    Action, BarSize, BracketChild, BracketGroup, BracketState, BrokerOrderStatus, ChildRole,
    Contract, FillEvent, OrderAck, OrderId, OrderRecord, OrderRequest, OrderRole,
    OrderStatusUpdate, OrderType, PermId, Symbol, TimeInForce, TradeIntent,
};
use crate::error::EngineError;
use crate::market_data::MarketDataCache;
use crate::observability;
use crate::persistence::{DurableStore, StoreError};
use crate::sizing::{MIN_RISK_FRACTION, SizingInput, size, take_profit_price};

const OUTCOME_CHANNEL_CAPACITY: usize = 1024;

/// Closed parents remembered for late redeliveries.
const CLOSED_BRACKET_MEMORY: usize = 4096;

#[derive(Debug, Clone)]
struct TrackedBracket {
    intent_id: String,
    intent: TradeIntent,
    contract: Contract,
    plan: TradePlan,
    parent: OrderAck,
    state: BracketState,
    exec_ids: HashSet<String>,
    filled: Decimal,
    fill_notional: Decimal,
    group: Option<BracketGroup>,
}

impl TrackedBracket {
    fn transition(&mut self, next: BracketState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                symbol = %self.plan.symbol,
                order_id = %self.parent.order_id,
                from = %self.state,
                to = %next,
                "Rejected bracket state transition"
            );
            return false;
        }
        info!(
            symbol = %self.plan.symbol,
            order_id = %self.parent.order_id,
            from = %self.state,
            to = %next,
            "Bracket state transition"
        );
        self.state = next;
        true
    }

    fn avg_fill_price(&self) -> Decimal {
        if self.filled.is_zero() {
            self.plan.entry_price
        } else {
            pricing::round_price(self.fill_notional / self.filled)
        }
    }
}

struct Placement {
    intent_id: String,
    intent: TradeIntent,
    contract: Contract,
    plan: TradePlan,
    fill_price: Decimal,
    filled: Decimal,
}

/// Bracket order state machine.
pub struct BracketMachine {
    session: Arc<BrokerSession>,
    cache: Arc<MarketDataCache>,
    store: Arc<dyn DurableStore>,
    config: ExecutionConfig,
    settle_delay: Duration,
    dedup: FillDedup,
    brackets: Mutex<HashMap<OrderId, TrackedBracket>>,
    closed: ClosedBrackets,
    children: Mutex<HashMap<OrderId, OrderId>>,
    prepared: Mutex<HashSet<(Symbol, BarSize)>>,
    outcomes: broadcast::Sender<IntentOutcome>,
}

impl std::fmt::Debug for BracketMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BracketMachine")
            .field("brackets", &self.brackets.lock().len())
            .field("markers", &self.dedup.len())
            .finish_non_exhaustive()
    }
}

impl BracketMachine {
    /// Create a machine with no tracked brackets.
    #[must_use]
    pub fn new(
        session: Arc<BrokerSession>,
        cache: Arc<MarketDataCache>,
        store: Arc<dyn DurableStore>,
        config: ExecutionConfig,
        settle_delay: Duration,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            session,
            cache,
            store,
            config,
            settle_delay,
            dedup: FillDedup::new(),
            brackets: Mutex::new(HashMap::new()),
            closed: ClosedBrackets::new(CLOSED_BRACKET_MEMORY),
            children: Mutex::new(HashMap::new()),
            prepared: Mutex::new(HashSet::new()),
            outcomes,
        }
    }

    /// Subscribe to intent outcomes.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<IntentOutcome> {
        self.outcomes.subscribe()
    }

    // Intent path

    /// Run an accepted intent to its first outcome and publish it.
    pub async fn process_intent(&self, intent_id: &str, intent: TradeIntent) -> IntentOutcome {
        let outcome = match self.run_intent(intent_id, &intent).await {
            Ok(outcome) => outcome,
            Err(err) => {
                observability::record_intent_rejected(err.code());
                warn!(
                    intent_id,
                    symbol = %intent.ticker,
                    code = %err.code(),
                    error = %err,
                    "Intent rejected"
                );
                IntentOutcome::rejected(intent_id, &err)
            }
        };
        self.publish(outcome.clone());
        outcome
    }

    async fn run_intent(
        &self,
        intent_id: &str,
        intent: &TradeIntent,
    ) -> Result<IntentOutcome, EngineError> {
        let (contract, plan) = self.plan(intent).await?;
        if !intent.submit {
            info!(
                intent_id,
                symbol = %plan.symbol,
                quantity = %plan.quantity,
                entry = %plan.entry_price,
                stop = %plan.stop_price,
                take_profit = %plan.take_profit,
                "Plan computed, not submitted"
            );
            return Ok(IntentOutcome::Planned {
                intent_id: intent_id.to_string(),
                plan,
            });
        }
        let ack = self
            .submit_parent(intent_id, intent, contract, plan.clone())
            .await?;
        Ok(IntentOutcome::ParentSubmitted {
            intent_id: intent_id.to_string(),
            order_id: ack.order_id,
            perm_id: ack.perm_id,
            plan,
        })
    }

    /// Validate, qualify and price an intent without sending anything.
    ///
    /// # Errors
    ///
    /// `INVALID_INPUT`, `CONTRACT_QUALIFICATION_FAILED`, `PRICE_UNAVAILABLE`
    /// or the session error from the balance lookup.
    pub async fn plan(&self, intent: &TradeIntent) -> Result<(Contract, TradePlan), EngineError> {
        intent.validate()?;
        if self.session.is_shutting_down() {
            return Err(EngineError::shutting_down());
        }
        let contract = self
            .cache
            .qualify(&self.session, &Contract::stock(intent.ticker.clone()))
            .await
            .map_err(|err| qualification_error(&intent.ticker, err))?;
        self.ensure_market_data(&contract, intent.timeframe).await;
        let balance = self.resolve_balance(intent).await?;
        let plan = self.compute_plan(intent, balance)?;
        Ok((contract, plan))
    }

    /// Warm up indicators and subscribe realtime bars, once per symbol and
    /// bar size. Failures are logged and retried on the next intent.
    pub async fn ensure_market_data(&self, contract: &Contract, bar_size: BarSize) {
        let key = (contract.symbol.clone(), bar_size);
        if !self.prepared.lock().insert(key.clone()) {
            return;
        }

        let mut ready = true;
        if !self.cache.has_series(&contract.symbol, bar_size) {
            if let Err(err) = self.cache.warm_up(&self.session, contract, bar_size).await {
                warn!(symbol = %contract.symbol, bar_size = %bar_size, error = %err, "Indicator warm-up failed");
                ready = false;
            }
        }
        match self.session.request_realtime_bars(contract, bar_size).await {
            Ok(()) => {
                debug!(symbol = %contract.symbol, bar_size = %bar_size, "Realtime bars subscribed");
                if !self.settle_delay.is_zero() {
                    tokio::time::sleep(self.settle_delay).await;
                }
            }
            Err(err) => {
                warn!(symbol = %contract.symbol, error = %err, "Realtime bar subscription failed");
                ready = false;
            }
        }
        if !ready {
            self.prepared.lock().remove(&key);
        }
    }

    async fn resolve_balance(&self, intent: &TradeIntent) -> Result<Decimal, EngineError> {
        if intent.account_balance > Decimal::ZERO {
            return Ok(intent.account_balance);
        }
        let summary = self.session.request_account_summary().await?;
        debug!(
            account = %summary.account,
            net_liquidation = %summary.net_liquidation,
            "Using broker net liquidation for sizing"
        );
        Ok(summary.net_liquidation)
    }

    /// Price and size an intent against the current cache contents.
    ///
    /// # Errors
    ///
    /// `PRICE_UNAVAILABLE` when entry or stop cannot be resolved,
    /// `INVALID_INPUT` when sizing inputs are out of range.
    pub fn compute_plan(
        &self,
        intent: &TradeIntent,
        balance: Decimal,
    ) -> Result<TradePlan, EngineError> {
        let symbol = &intent.ticker;
        let snapshot = self.cache.get_snapshot(symbol);
        let indicators = self.cache.get_indicators(symbol, intent.timeframe);
        let last_close = indicators.as_ref().map(|i| i.last_close);

        let (entry_price, entry_source) =
            pricing::resolve_entry_price(intent, snapshot.as_deref(), last_close)?;
        let (stop_price, stop_source) = pricing::resolve_stop(
            intent,
            entry_price,
            indicators.as_deref(),
            self.config.stop_epsilon,
        )?;
        let reward_risk = intent
            .reward_risk
            .unwrap_or(self.config.default_reward_risk);

        let sizing = size(&SizingInput {
            entry_price,
            stop_price,
            account_balance: balance,
            risk_pct: intent.risk_pct,
            reward_risk,
            action: intent.action,
        })?;

        Ok(TradePlan {
            symbol: symbol.clone(),
            action: intent.action,
            entry_price,
            entry_source,
            stop_price,
            stop_source,
            quantity: intent.explicit_quantity().unwrap_or(sizing.quantity),
            take_profit: sizing.take_profit,
            reward_risk,
            account_balance: balance,
            commission: sizing.commission,
            per_share_risk: sizing.per_share_risk,
            tolerated_risk: sizing.tolerated_risk,
        })
    }

    /// Send the parent order and start tracking it.
    ///
    /// # Errors
    ///
    /// `ORDER_PLACEMENT_FAILED` when the broker refuses or times out.
    pub async fn submit_parent(
        &self,
        intent_id: &str,
        intent: &TradeIntent,
        contract: Contract,
        plan: TradePlan,
    ) -> Result<OrderAck, EngineError> {
        let symbol = plan.symbol.clone();
        info!(
            intent_id,
            symbol = %symbol,
            state = %BracketState::Pending,
            quantity = %plan.quantity,
            entry = %plan.entry_price,
            "Submitting parent order"
        );
        let side = intent.action.entry_side();
        let request = match self.config.entry_order_type {
            OrderType::Market => OrderRequest::market(contract.clone(), side, plan.quantity),
            OrderType::Limit | OrderType::Stop => {
                OrderRequest::limit(contract.clone(), side, plan.quantity, plan.entry_price)
                    .with_tif(TimeInForce::Day)
                    .outside_rth(self.config.outside_rth)
            }
        }
        .with_ref(format!("entry:{intent_id}"));

        let ack = self.session.place_order(&request).await.map_err(|err| {
            error!(
                intent_id,
                symbol = %symbol,
                state = %BracketState::Error,
                error = %err,
                "Parent order placement failed"
            );
            placement_error(&symbol, "parent", err)
        })?;

        let mut tracked = TrackedBracket {
            intent_id: intent_id.to_string(),
            intent: intent.clone(),
            contract,
            plan,
            parent: ack,
            state: BracketState::Pending,
            exec_ids: HashSet::new(),
            filled: Decimal::ZERO,
            fill_notional: Decimal::ZERO,
            group: None,
        };
        tracked.transition(BracketState::ParentSubmitted);
        self.brackets.lock().insert(ack.order_id, tracked);
        self.persist(&OrderRecord::placed(&request, ack, OrderRole::Parent))
            .await;
        Ok(ack)
    }

    // Fill path

    /// Handle one fill notification.
    pub async fn on_fill(&self, fill: &FillEvent) -> FillOutcome {
        if self.parent_of(fill.order_id).is_some() {
            self.record_fill(fill).await;
            debug!(symbol = %fill.symbol, order_id = %fill.order_id, "Bracket child fill recorded");
            return FillOutcome::ChildFill;
        }

        let progress = {
            let mut brackets = self.brackets.lock();
            let Some(tracked) = brackets.get_mut(&fill.order_id) else {
                if self.closed.get(fill.order_id).is_some() {
                    observability::record_duplicate_fill();
                    debug!(order_id = %fill.order_id, "Fill for a closed bracket ignored");
                    return FillOutcome::Duplicate;
                }
                return FillOutcome::NotTracked;
            };
            let fresh = tracked.exec_ids.insert(fill.exec_id.clone());
            if fresh {
                tracked.filled += fill.shares;
                tracked.fill_notional += fill.shares * fill.price;
            }
            (fresh, tracked.filled, tracked.plan.quantity)
        };
        let (fresh, filled, quantity) = progress;
        if fresh {
            self.record_fill(fill).await;
        }

        if filled < quantity {
            if fresh {
                info!(
                    symbol = %fill.symbol,
                    order_id = %fill.order_id,
                    filled = %filled,
                    quantity = %quantity,
                    "Parent partially filled"
                );
                return FillOutcome::PartialFill { filled, quantity };
            }
            observability::record_duplicate_fill();
            return FillOutcome::Duplicate;
        }
        self.attach_bracket(fill.order_id).await
    }

    async fn attach_bracket(&self, parent_id: OrderId) -> FillOutcome {
        let Some(perm_id) = self
            .brackets
            .lock()
            .get(&parent_id)
            .map(|t| t.parent.perm_id)
        else {
            return FillOutcome::NotTracked;
        };

        if !self.dedup.try_mark(perm_id) {
            observability::record_duplicate_fill();
            debug!(order_id = %parent_id, perm_id = %perm_id, "Bracket placement already in flight");
            return FillOutcome::Duplicate;
        }

        let placement = {
            let mut brackets = self.brackets.lock();
            let Some(tracked) = brackets.get_mut(&parent_id) else {
                self.dedup.release(perm_id);
                return FillOutcome::NotTracked;
            };
            if !tracked.state.accepts_fill() {
                self.dedup.release(perm_id);
                observability::record_duplicate_fill();
                debug!(order_id = %parent_id, state = %tracked.state, "Fill after bracket placement ignored");
                return FillOutcome::Duplicate;
            }
            if tracked.state != BracketState::ParentFilled {
                tracked.transition(BracketState::ParentFilled);
            }
            Placement {
                intent_id: tracked.intent_id.clone(),
                intent: tracked.intent.clone(),
                contract: tracked.contract.clone(),
                plan: tracked.plan.clone(),
                fill_price: tracked.avg_fill_price(),
                filled: tracked.filled,
            }
        };

        match self.place_children(parent_id, perm_id, &placement).await {
            Ok(Some(group)) => {
                {
                    let mut brackets = self.brackets.lock();
                    if let Some(tracked) = brackets.get_mut(&parent_id) {
                        tracked.group = Some(group.clone());
                        tracked.transition(BracketState::BracketPlaced);
                    }
                }
                {
                    let mut children = self.children.lock();
                    children.insert(group.take_profit.order_id, parent_id);
                    children.insert(group.stop_loss.order_id, parent_id);
                }
                observability::record_bracket_placed(group.symbol.as_str());
                info!(
                    symbol = %group.symbol,
                    parent = %parent_id,
                    oca_group = %group.oca_group,
                    quantity = %group.quantity,
                    take_profit = %group.take_profit.price,
                    stop_loss = %group.stop_loss.price,
                    "Bracket placed"
                );
                self.publish(IntentOutcome::BracketPlaced {
                    intent_id: placement.intent_id,
                    group: group.clone(),
                });
                FillOutcome::BracketPlaced(group)
            }
            Ok(None) => {
                self.dedup.release(perm_id);
                FillOutcome::NoPosition
            }
            Err(err) => {
                if let Some(tracked) = self.brackets.lock().get_mut(&parent_id) {
                    tracked.transition(BracketState::Error);
                }
                self.dedup.release(perm_id);
                error!(
                    symbol = %placement.plan.symbol,
                    parent = %parent_id,
                    error = %err,
                    "Bracket placement failed"
                );
                self.publish(IntentOutcome::rejected(placement.intent_id, &err));
                FillOutcome::Failed(err)
            }
        }
    }

    async fn place_children(
        &self,
        parent_id: OrderId,
        perm_id: PermId,
        placement: &Placement,
    ) -> Result<Option<BracketGroup>, EngineError> {
        let symbol = &placement.plan.symbol;
        let action = placement.intent.action;

        let positions = self.session.request_positions().await?;
        let position = positions
            .iter()
            .find(|p| &p.symbol == symbol)
            .map_or(Decimal::ZERO, |p| p.quantity);
        let same_direction = match action {
            Action::Buy => position > Decimal::ZERO,
            Action::Sell => position < Decimal::ZERO,
        };
        if !same_direction {
            warn!(
                symbol = %symbol,
                parent = %parent_id,
                position = %position,
                "No matching broker position for filled parent, bracket deferred"
            );
            return Ok(None);
        }
        let quantity = position.abs().min(placement.filled);

        let fill_price = placement.fill_price;
        let indicators = self.cache.get_indicators(symbol, placement.intent.timeframe);
        let stop = pricing::bracket_stop(
            &placement.intent,
            fill_price,
            placement.plan.stop_price,
            placement.plan.per_share_risk,
            indicators.as_deref(),
            self.config.stop_epsilon,
        );
        let risk = (fill_price - stop).abs().max(fill_price * MIN_RISK_FRACTION);
        let target = take_profit_price(fill_price, risk, placement.plan.reward_risk, action);

        let oca_group = format!("oca-{}", Uuid::new_v4());
        let exit = action.exit_side();
        let take_profit = OrderRequest::limit(placement.contract.clone(), exit, quantity, target)
            .with_oca(oca_group.clone())
            .with_ref(format!("tp:{}", placement.intent_id))
            .outside_rth(self.config.outside_rth);
        let stop_loss = OrderRequest::stop(placement.contract.clone(), exit, quantity, stop)
            .with_oca(oca_group.clone())
            .with_ref(format!("sl:{}", placement.intent_id))
            .outside_rth(self.config.outside_rth);

        let tp_ack = self
            .session
            .place_order(&take_profit)
            .await
            .map_err(|err| placement_error(symbol, "take-profit", err))?;
        let sl_ack = match self.session.place_order(&stop_loss).await {
            Ok(ack) => ack,
            Err(err) => {
                if let Err(cancel_err) = self.session.cancel_order(tp_ack.order_id).await {
                    warn!(
                        symbol = %symbol,
                        order_id = %tp_ack.order_id,
                        error = %cancel_err,
                        "Could not cancel orphaned take-profit"
                    );
                }
                return Err(placement_error(symbol, "stop-loss", err));
            }
        };

        self.persist(&OrderRecord::placed(&take_profit, tp_ack, OrderRole::TakeProfit))
            .await;
        self.persist(&OrderRecord::placed(&stop_loss, sl_ack, OrderRole::StopLoss))
            .await;

        Ok(Some(BracketGroup {
            symbol: symbol.clone(),
            parent_order_id: parent_id,
            parent_perm_id: perm_id,
            oca_group,
            quantity,
            take_profit: BracketChild {
                role: ChildRole::TakeProfit,
                order_id: tp_ack.order_id,
                perm_id: tp_ack.perm_id,
                price: target,
                status: BrokerOrderStatus::Submitted,
            },
            stop_loss: BracketChild {
                role: ChildRole::StopLoss,
                order_id: sl_ack.order_id,
                perm_id: sl_ack.perm_id,
                price: stop,
                status: BrokerOrderStatus::Submitted,
            },
            created_at: Utc::now(),
        }))
    }

    // Status path

    /// Apply an order status update. Returns the bracket's state afterwards
    /// if the order belongs to a tracked bracket.
    pub async fn on_order_status(&self, update: &OrderStatusUpdate) -> Option<BracketState> {
        if update.status.is_terminal() {
            self.close_record(update.order_id, update.status).await;
        }
        if let Some(parent_id) = self.parent_of(update.order_id) {
            return self.on_child_status(parent_id, update);
        }

        let needs_bracket = {
            let mut brackets = self.brackets.lock();
            let Some(tracked) = brackets.get_mut(&update.order_id) else {
                return self.closed.get(update.order_id);
            };
            if !update.status.is_dead() || tracked.state.is_terminal() {
                return Some(tracked.state);
            }
            if tracked.filled < update.filled {
                if let Some(avg) = update.avg_fill_price {
                    tracked.fill_notional = avg * update.filled;
                    tracked.filled = update.filled;
                }
            }
            if tracked.filled.is_zero() {
                if tracked.state == BracketState::ParentSubmitted
                    && tracked.transition(BracketState::BracketCancelled)
                {
                    let intent_id = tracked.intent_id.clone();
                    self.retire(&mut brackets, update.order_id, BracketState::BracketCancelled);
                    self.publish(IntentOutcome::Closed {
                        intent_id,
                        parent_order_id: update.order_id,
                        state: BracketState::BracketCancelled,
                    });
                    return Some(BracketState::BracketCancelled);
                }
                false
            } else {
                tracked.state.accepts_fill()
            }
        };

        if needs_bracket {
            info!(
                symbol = %update.symbol,
                order_id = %update.order_id,
                status = ?update.status,
                "Parent closed after partial fill, protecting filled shares"
            );
            self.attach_bracket(update.order_id).await;
        }
        self.state_of(update.order_id)
    }

    fn on_child_status(&self, parent_id: OrderId, update: &OrderStatusUpdate) -> Option<BracketState> {
        let (state, perm_id, intent_id, group) = {
            let mut brackets = self.brackets.lock();
            let tracked = brackets.get_mut(&parent_id)?;
            let group = tracked.group.as_mut()?;
            group.child_mut(update.order_id)?.status = update.status;
            let Some(terminal) = group.terminal_state() else {
                return Some(tracked.state);
            };
            if tracked.state.is_terminal() || !tracked.transition(terminal) {
                return Some(tracked.state);
            }
            let closed = (
                terminal,
                tracked.parent.perm_id,
                tracked.intent_id.clone(),
                tracked.group.take(),
            );
            self.retire(&mut brackets, parent_id, terminal);
            closed
        };

        if let Some(group) = group {
            let mut children = self.children.lock();
            children.remove(&group.take_profit.order_id);
            children.remove(&group.stop_loss.order_id);
        }
        self.dedup.release(perm_id);
        info!(symbol = %update.symbol, parent = %parent_id, state = %state, "Bracket closed");
        self.publish(IntentOutcome::Closed {
            intent_id,
            parent_order_id: parent_id,
            state,
        });
        Some(state)
    }

    // Queries

    /// State of the bracket whose parent is `parent_id`.
    #[must_use]
    pub fn state_of(&self, parent_id: OrderId) -> Option<BracketState> {
        let live = self.brackets.lock().get(&parent_id).map(|t| t.state);
        live.or_else(|| self.closed.get(parent_id))
    }

    /// Live bracket group for a parent.
    #[must_use]
    pub fn group_of(&self, parent_id: OrderId) -> Option<BracketGroup> {
        self.brackets
            .lock()
            .get(&parent_id)
            .and_then(|t| t.group.clone())
    }

    /// Parent of a live child order.
    #[must_use]
    pub fn parent_of(&self, child_id: OrderId) -> Option<OrderId> {
        self.children.lock().get(&child_id).copied()
    }

    /// Whether a placement marker is held for `perm_id`.
    #[must_use]
    pub fn is_marked(&self, perm_id: PermId) -> bool {
        self.dedup.is_marked(perm_id)
    }

    /// Brackets not yet in a terminal state.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.brackets
            .lock()
            .values()
            .filter(|t| !t.state.is_terminal())
            .count()
    }

    /// Brackets held in memory, terminal ones excluded.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.brackets.lock().len()
    }

    // Helpers

    fn retire(
        &self,
        brackets: &mut HashMap<OrderId, TrackedBracket>,
        parent_id: OrderId,
        state: BracketState,
    ) {
        brackets.remove(&parent_id);
        self.closed.remember(parent_id, state);
    }

    fn publish(&self, outcome: IntentOutcome) {
        let _ = self.outcomes.send(outcome);
    }

    async fn persist(&self, record: &OrderRecord) {
        if let Err(err) = self.store.insert_order(record).await {
            warn!(symbol = %record.symbol, order_id = %record.order_id, error = %err, "Failed to store order");
        }
    }

    async fn record_fill(&self, fill: &FillEvent) {
        match self.store.insert_fill(fill.order_id, fill).await {
            Ok(()) => {}
            Err(StoreError::NotFound { .. }) => {
                debug!(order_id = %fill.order_id, "Fill for an order not in the store");
            }
            Err(err) => warn!(order_id = %fill.order_id, error = %err, "Failed to store fill"),
        }
    }

    async fn close_record(&self, order_id: OrderId, status: BrokerOrderStatus) {
        match self.store.mark_order_closed(order_id, status).await {
            Ok(()) | Err(StoreError::NotFound { .. }) => {}
            Err(err) => warn!(order_id = %order_id, error = %err, "Failed to close stored order"),
        }
    }
}

fn qualification_error(symbol: &Symbol, err: SessionError) -> EngineError {
    match err {
        SessionError::Broker(inner) => {
            EngineError::qualification_failed(symbol.as_str(), inner.to_string())
        }
        other => other.into(),
    }
}

fn placement_error(symbol: &Symbol, leg: &str, err: SessionError) -> EngineError {
    match err {
        SessionError::Broker(inner) => {
            EngineError::placement_failed(symbol.as_str(), format!("{leg} order: {inner}"))
        }
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SessionSettings;
    use crate::config::IndicatorsConfig;
    use crate::domain::{Bar, TickUpdate};
    use crate::error::ErrorCode;
    use crate::paper::PaperGateway;
    use crate::persistence::InMemoryStore;
    use rust_decimal_macros::dec;

    struct Harness {
        paper: Arc<PaperGateway>,
        store: Arc<InMemoryStore>,
        cache: Arc<MarketDataCache>,
        machine: Arc<BracketMachine>,
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
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(MarketDataCache::new(IndicatorsConfig::default()));
        let machine = Arc::new(BracketMachine::new(
            session,
            cache.clone(),
            store.clone(),
            ExecutionConfig::default(),
            Duration::ZERO,
        ));
        Harness {
            paper,
            store,
            cache,
            machine,
        }
    }

    fn explicit_intent() -> TradeIntent {
        let mut intent = TradeIntent::new("AAPL", Action::Buy);
        intent.entry_price = Some(dec!(100));
        intent.stop_loss = Some(dec!(98));
        intent.account_balance = dec!(10000);
        intent.reward_risk = Some(dec!(2));
        intent
    }

    async fn submitted(h: &Harness, intent: TradeIntent) -> OrderAck {
        match h.machine.process_intent("t-1", intent).await {
            IntentOutcome::ParentSubmitted {
                order_id, perm_id, ..
            } => OrderAck { order_id, perm_id },
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn plan_only_sends_nothing() {
        let h = harness().await;
        let mut intent = explicit_intent();
        intent.submit = false;
        let outcome = h.machine.process_intent("t-1", intent).await;
        let IntentOutcome::Planned { plan, .. } = outcome else {
            panic!("expected a plan");
        };
        assert_eq!(plan.quantity, dec!(50));
        assert_eq!(plan.take_profit, dec!(104.00));
        assert_eq!(plan.entry_source, pricing::PriceSource::Intent);
        assert!(h.paper.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn fill_places_one_oca_pair() {
        let h = harness().await;
        let ack = submitted(&h, explicit_intent()).await;
        assert_eq!(h.machine.state_of(ack.order_id), Some(BracketState::ParentSubmitted));

        let fill = h.paper.fill_order(ack.order_id, dec!(100)).unwrap();
        let FillOutcome::BracketPlaced(group) = h.machine.on_fill(&fill).await else {
            panic!("expected bracket");
        };
        assert_eq!(group.quantity, dec!(50));
        assert_eq!(group.take_profit.price, dec!(104.00));
        assert_eq!(group.stop_loss.price, dec!(98));
        assert_eq!(h.machine.state_of(ack.order_id), Some(BracketState::BracketPlaced));

        assert_eq!(h.machine.on_fill(&fill).await, FillOutcome::Duplicate);
        let children = h.paper.oca_orders(&Symbol::new("AAPL"));
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|(_, r, _)| r.oca_group.as_deref() == Some(group.oca_group.as_str())));
        assert!(children.iter().all(|(_, r, _)| r.side == crate::domain::OrderSide::Sell));
        assert_eq!(h.store.order_count(), 3);
    }

    #[tokio::test]
    async fn concurrent_fill_handlers_place_once() {
        let h = harness().await;
        let ack = submitted(&h, explicit_intent()).await;
        let fill = h.paper.fill_order(ack.order_id, dec!(100)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let machine = Arc::clone(&h.machine);
                let fill = fill.clone();
                tokio::spawn(async move { machine.on_fill(&fill).await })
            })
            .collect();
        let mut placed = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), FillOutcome::BracketPlaced(_)) {
                placed += 1;
            }
        }
        assert_eq!(placed, 1);
        assert_eq!(h.paper.oca_orders(&Symbol::new("AAPL")).len(), 2);
    }

    #[tokio::test]
    async fn missing_position_defers_and_retries() {
        let h = harness().await;
        let ack = submitted(&h, explicit_intent()).await;
        let fill = h.paper.fill_order(ack.order_id, dec!(100)).unwrap();
        h.paper.set_position("AAPL", Decimal::ZERO, Decimal::ZERO);

        assert_eq!(h.machine.on_fill(&fill).await, FillOutcome::NoPosition);
        assert_eq!(h.machine.state_of(ack.order_id), Some(BracketState::ParentFilled));
        assert!(!h.machine.is_marked(ack.perm_id));

        h.paper.set_position("AAPL", dec!(50), dec!(100));
        assert!(matches!(h.machine.on_fill(&fill).await, FillOutcome::BracketPlaced(_)));
    }

    #[tokio::test]
    async fn child_rejection_leaves_retryable_error() {
        let h = harness().await;
        let ack = submitted(&h, explicit_intent()).await;
        let fill = h.paper.fill_order(ack.order_id, dec!(100)).unwrap();
        h.paper.reject_next_orders(1);

        let FillOutcome::Failed(err) = h.machine.on_fill(&fill).await else {
            panic!("expected failure");
        };
        assert_eq!(err.code(), ErrorCode::OrderPlacementFailed);
        assert_eq!(h.machine.state_of(ack.order_id), Some(BracketState::Error));
        assert!(!h.machine.is_marked(ack.perm_id));

        assert!(matches!(h.machine.on_fill(&fill).await, FillOutcome::BracketPlaced(_)));
    }

    #[tokio::test]
    async fn child_fill_closes_bracket() {
        let h = harness().await;
        let ack = submitted(&h, explicit_intent()).await;
        let fill = h.paper.fill_order(ack.order_id, dec!(100)).unwrap();
        let FillOutcome::BracketPlaced(group) = h.machine.on_fill(&fill).await else {
            panic!("expected bracket");
        };

        let tp_fill = h
            .paper
            .fill_order(group.take_profit.order_id, dec!(104))
            .unwrap();
        assert_eq!(h.machine.on_fill(&tp_fill).await, FillOutcome::ChildFill);
        let filled = OrderStatusUpdate {
            order_id: group.take_profit.order_id,
            perm_id: group.take_profit.perm_id,
            symbol: group.symbol.clone(),
            status: BrokerOrderStatus::Filled,
            filled: group.quantity,
            remaining: Decimal::ZERO,
            avg_fill_price: Some(dec!(104)),
        };
        assert_eq!(
            h.machine.on_order_status(&filled).await,
            Some(BracketState::BracketFilled)
        );
        assert!(h.machine.group_of(ack.order_id).is_none());
        assert!(h.machine.parent_of(group.stop_loss.order_id).is_none());
        assert!(!h.machine.is_marked(ack.perm_id));
        assert_eq!(h.machine.active_count(), 0);
        assert_eq!(h.machine.tracked_count(), 0);
        assert_eq!(h.machine.state_of(ack.order_id), Some(BracketState::BracketFilled));

        // a late redelivery of the parent fill does nothing
        assert_eq!(h.machine.on_fill(&fill).await, FillOutcome::Duplicate);
    }

    #[tokio::test]
    async fn cancelled_parent_closes_without_bracket() {
        let h = harness().await;
        let ack = submitted(&h, explicit_intent()).await;
        let cancelled = OrderStatusUpdate {
            order_id: ack.order_id,
            perm_id: ack.perm_id,
            symbol: Symbol::new("AAPL"),
            status: BrokerOrderStatus::Cancelled,
            filled: Decimal::ZERO,
            remaining: dec!(50),
            avg_fill_price: None,
        };
        assert_eq!(
            h.machine.on_order_status(&cancelled).await,
            Some(BracketState::BracketCancelled)
        );
        assert!(h.store.list_open_orders().await.unwrap().is_empty());
        assert_eq!(h.machine.tracked_count(), 0);
        assert_eq!(
            h.machine.on_order_status(&cancelled).await,
            Some(BracketState::BracketCancelled)
        );
    }

    #[tokio::test]
    async fn closed_brackets_leave_the_live_map() {
        let h = harness().await;
        let mut parents = Vec::new();
        for ticker in ["AAPL", "MSFT", "NVDA"] {
            let mut intent = explicit_intent();
            intent.ticker = Symbol::new(ticker);
            let ack = submitted(&h, intent).await;
            let fill = h.paper.fill_order(ack.order_id, dec!(100)).unwrap();
            let FillOutcome::BracketPlaced(group) = h.machine.on_fill(&fill).await else {
                panic!("expected bracket");
            };
            parents.push((ack, group));
        }
        assert_eq!(h.machine.tracked_count(), 3);

        for (ack, group) in &parents {
            let stopped = OrderStatusUpdate {
                order_id: group.stop_loss.order_id,
                perm_id: group.stop_loss.perm_id,
                symbol: group.symbol.clone(),
                status: BrokerOrderStatus::Filled,
                filled: group.quantity,
                remaining: Decimal::ZERO,
                avg_fill_price: Some(group.stop_loss.price),
            };
            h.machine.on_order_status(&stopped).await;
            assert!(!h.machine.is_marked(ack.perm_id));
        }
        assert_eq!(h.machine.tracked_count(), 0);
        assert!(h.machine.parent_of(parents[0].1.take_profit.order_id).is_none());
    }

    #[tokio::test]
    async fn partial_fills_wait_for_the_rest() {
        let h = harness().await;
        let ack = submitted(&h, explicit_intent()).await;
        let first = h.paper.fill_partial(ack.order_id, dec!(20), dec!(100)).unwrap();
        assert_eq!(
            h.machine.on_fill(&first).await,
            FillOutcome::PartialFill {
                filled: dec!(20),
                quantity: dec!(50)
            }
        );
        assert_eq!(h.machine.on_fill(&first).await, FillOutcome::Duplicate);

        let rest = h.paper.fill_order(ack.order_id, dec!(100)).unwrap();
        let FillOutcome::BracketPlaced(group) = h.machine.on_fill(&rest).await else {
            panic!("expected bracket");
        };
        assert_eq!(group.quantity, dec!(50));
    }

    #[tokio::test]
    async fn partially_filled_parent_cancel_protects_filled_shares() {
        let h = harness().await;
        let ack = submitted(&h, explicit_intent()).await;
        let first = h.paper.fill_partial(ack.order_id, dec!(20), dec!(100)).unwrap();
        h.machine.on_fill(&first).await;
        let cancelled = OrderStatusUpdate {
            order_id: ack.order_id,
            perm_id: ack.perm_id,
            symbol: Symbol::new("AAPL"),
            status: BrokerOrderStatus::Cancelled,
            filled: dec!(20),
            remaining: dec!(30),
            avg_fill_price: Some(dec!(100)),
        };
        assert_eq!(
            h.machine.on_order_status(&cancelled).await,
            Some(BracketState::BracketPlaced)
        );
        assert_eq!(h.machine.group_of(ack.order_id).unwrap().quantity, dec!(20));
    }

    #[tokio::test]
    async fn unknown_symbol_is_rejected() {
        let h = harness().await;
        h.paper.mark_unknown("ZZZZ");
        let mut intent = explicit_intent();
        intent.ticker = Symbol::new("ZZZZ");
        let outcome = h.machine.process_intent("t-1", intent).await;
        assert!(matches!(
            outcome,
            IntentOutcome::Rejected {
                code: ErrorCode::ContractQualificationFailed,
                ..
            }
        ));
        assert!(h.paper.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn no_quote_no_bars_is_price_unavailable() {
        let h = harness().await;
        let mut intent = explicit_intent();
        intent.entry_price = None;
        let outcome = h.machine.process_intent("t-1", intent).await;
        assert!(matches!(
            outcome,
            IntentOutcome::Rejected {
                code: ErrorCode::PriceUnavailable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn sizes_from_quote_and_net_liquidation() {
        let h = harness().await;
        h.paper.set_net_liquidation(dec!(20000));
        let mut tick = TickUpdate::new("AAPL");
        tick.bid = Some(49.98);
        tick.ask = Some(50.02);
        h.cache.on_tick(&tick);

        let mut intent = TradeIntent::new("AAPL", Action::Buy);
        intent.stop_loss = Some(dec!(49));
        let (_, plan) = h.machine.plan(&intent).await.unwrap();
        assert_eq!(plan.entry_price, dec!(50.02));
        assert_eq!(plan.account_balance, dec!(20000));
        assert_eq!(plan.entry_source, pricing::PriceSource::Quote);
    }

    #[tokio::test]
    async fn vol_stop_drives_the_stop() {
        let h = harness().await;
        let bars: Vec<Bar> = (0..40)
            .map(|i| {
                let close = 100.0 + f64::from(i) * 0.5;
                Bar {
                    time: Utc::now() - chrono::Duration::minutes(5 * (40 - i64::from(i))),
                    open: close - 0.2,
                    high: close + 0.5,
                    low: close - 0.5,
                    close,
                    volume: 1000.0,
                }
            })
            .collect();
        h.paper.set_history("AAPL", bars);

        let mut intent = TradeIntent::new("AAPL", Action::Buy);
        intent.account_balance = dec!(10000);
        let (_, plan) = h.machine.plan(&intent).await.unwrap();
        assert_eq!(plan.entry_source, pricing::PriceSource::BarClose);
        assert_eq!(plan.stop_source, pricing::PriceSource::VolatilityStop);
        assert!(plan.stop_price < plan.entry_price);
        assert_eq!(h.paper.realtime_subscription_requests(), 1);
    }
}
