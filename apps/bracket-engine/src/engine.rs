//! Engine wiring.
//!
//! Owns the broker session and every component built on it. Broker push
//! events are dispatched from one task: per-symbol events go through the
//! [`SymbolRouter`], PnL and position updates go to the guard. The guard
//! and reconciliation loops run as background tasks until shutdown.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerEvent, BrokerGateway, BrokerSession, SessionState};
use crate::config::Config;
use crate::domain::{Symbol, TradeIntent};
use crate::error::EngineError;
use crate::execution::{
    BracketMachine, IntentAck, IntentOutcome, SymbolEvent, SymbolHandler, SymbolRouter, TradePlan,
};
use crate::guard::{Clock, PnlGuard, SystemClock};
use crate::market_data::MarketDataCache;
use crate::observability;
use crate::persistence::DurableStore;
use crate::reconciliation::{ReconciliationReport, Reconciler};

/// Applies routed events for one symbol.
struct EventHandler {
    cache: Arc<MarketDataCache>,
    machine: Arc<BracketMachine>,
    guard: Arc<PnlGuard>,
}

#[async_trait]
impl SymbolHandler for EventHandler {
    async fn handle(&self, symbol: &Symbol, event: SymbolEvent) {
        match event {
            SymbolEvent::Tick(tick) => {
                self.cache.on_tick(&tick);
            }
            SymbolEvent::Bar(bar) => {
                self.cache.on_bar_close(&bar);
            }
            SymbolEvent::OrderStatus(update) => {
                self.machine.on_order_status(&update).await;
                self.guard.on_order_status(&update);
            }
            SymbolEvent::Fill(fill) => {
                let outcome = self.machine.on_fill(&fill).await;
                debug!(symbol = %symbol, exec_id = %fill.exec_id, outcome = ?outcome, "Fill handled");
            }
            SymbolEvent::Intent { intent_id, intent } => {
                self.machine.process_intent(&intent_id, *intent).await;
            }
        }
    }
}

/// The bracket execution engine.
pub struct Engine {
    config: Config,
    session: Arc<BrokerSession>,
    cache: Arc<MarketDataCache>,
    machine: Arc<BracketMachine>,
    guard: Arc<PnlGuard>,
    reconciler: Arc<Reconciler>,
    router: Arc<SymbolRouter<EventHandler>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("machine", &self.machine)
            .field("guard", &self.guard)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine over a gateway and store. Nothing runs until
    /// [`Engine::start`].
    #[must_use]
    pub fn new(config: Config, gateway: Arc<dyn BrokerGateway>, store: Arc<dyn DurableStore>) -> Self {
        Self::with_clock(config, gateway, store, Arc::new(SystemClock))
    }

    /// Build an engine with an explicit market-hours clock.
    #[must_use]
    pub fn with_clock(
        config: Config,
        gateway: Arc<dyn BrokerGateway>,
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let session = BrokerSession::new(gateway, config.broker.session_settings());
        let cache = Arc::new(MarketDataCache::new(config.indicators.clone()));
        let machine = Arc::new(BracketMachine::new(
            Arc::clone(&session),
            Arc::clone(&cache),
            Arc::clone(&store),
            config.execution.clone(),
            config.broker.settle_delay(),
        ));
        let guard = Arc::new(PnlGuard::new(
            Arc::clone(&session),
            Arc::clone(&cache),
            Arc::clone(&store),
            config.risk.clone(),
            clock,
        ));
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&session), store));
        let shutdown = CancellationToken::new();
        let handler = Arc::new(EventHandler {
            cache: Arc::clone(&cache),
            machine: Arc::clone(&machine),
            guard: Arc::clone(&guard),
        });
        let router = Arc::new(SymbolRouter::new(
            handler,
            config.execution.inbox_capacity,
            shutdown.child_token(),
        ));
        Self {
            config,
            session,
            cache,
            machine,
            guard,
            reconciler,
            router,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Connect, subscribe to account PnL and start the background loops.
    ///
    /// # Errors
    ///
    /// `CONNECTION_EXHAUSTED` if the session could not be established, or
    /// the broker error from the PnL subscription.
    pub async fn start(&self) -> Result<(), EngineError> {
        // Subscribe before connecting so no push event is missed.
        let events = self.session.subscribe();
        self.session.connect().await?;

        let account = self.config.risk.account_id.clone();
        if account.is_empty() {
            warn!("risk.account_id is empty, PnL guard receives no updates");
        } else {
            self.session.request_pnl(&account).await?;
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(dispatch(
            events,
            Arc::clone(&self.router),
            Arc::clone(&self.guard),
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(
            Arc::clone(&self.guard).run(self.shutdown.clone()),
        ));
        if self.config.reconciliation.enabled {
            tasks.push(tokio::spawn(Arc::clone(&self.reconciler).run(
                self.config.reconciliation.interval(),
                self.shutdown.clone(),
            )));
        }
        self.tasks.lock().extend(tasks);

        info!(
            account = %account,
            reconciliation = self.config.reconciliation.enabled,
            "Bracket engine started"
        );
        Ok(())
    }

    /// Accept an intent for asynchronous processing.
    ///
    /// Returns immediately. Validation failures are rejected here, anything
    /// discovered later is published on [`Engine::outcomes`].
    pub async fn submit(&self, intent: TradeIntent) -> IntentAck {
        if let Err(err) = intent.validate() {
            observability::record_intent_rejected(err.code());
            warn!(symbol = %intent.ticker, error = %err, "Intent rejected on submit");
            return IntentAck::rejected(&err);
        }
        if self.shutdown.is_cancelled() || self.session.is_shutting_down() {
            let err = EngineError::shutting_down();
            observability::record_intent_rejected(err.code());
            return IntentAck::rejected(&err);
        }

        let intent_id = Uuid::new_v4().to_string();
        let symbol = intent.ticker.clone();
        let event = SymbolEvent::Intent {
            intent_id: intent_id.clone(),
            intent: Box::new(intent),
        };
        if let Err(err) = self.router.route(&symbol, event) {
            warn!(symbol = %symbol, error = %err, "Intent not queued");
            let err = EngineError::shutting_down();
            observability::record_intent_rejected(err.code());
            return IntentAck::rejected(&err);
        }
        info!(intent_id = %intent_id, symbol = %symbol, "Intent accepted");
        IntentAck::Accepted { intent_id }
    }

    /// Compute the plan for an intent without placing anything.
    ///
    /// # Errors
    ///
    /// The rejection the intent would receive.
    pub async fn plan(&self, intent: &TradeIntent) -> Result<TradePlan, EngineError> {
        self.machine.plan(intent).await.map(|(_, plan)| plan)
    }

    /// Run one reconciliation pass now.
    ///
    /// # Errors
    ///
    /// The broker error if broker state could not be fetched.
    pub async fn reconcile(&self) -> Result<ReconciliationReport, EngineError> {
        Ok(self.reconciler.reconcile().await?)
    }

    /// Subscribe to intent outcomes.
    pub fn outcomes(&self) -> broadcast::Receiver<IntentOutcome> {
        self.machine.subscribe_outcomes()
    }

    /// Watch the broker session state.
    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.session.state()
    }

    /// Bracket state machine.
    #[must_use]
    pub const fn machine(&self) -> &Arc<BracketMachine> {
        &self.machine
    }

    /// PnL guard.
    #[must_use]
    pub const fn guard(&self) -> &Arc<PnlGuard> {
        &self.guard
    }

    /// Market data cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<MarketDataCache> {
        &self.cache
    }

    /// Reconciler.
    #[must_use]
    pub const fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Stop accepting work, drain the symbol workers, stop the loops and
    /// close the session.
    pub async fn shutdown(&self) {
        info!("Bracket engine shutting down");
        self.shutdown.cancel();
        self.router.shutdown().await;
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(err) = result {
                warn!(error = %err, "Background task ended abnormally");
            }
        }
        if let Err(err) = self.session.disconnect().await {
            warn!(error = %err, "Disconnect failed");
        }
        info!("Bracket engine stopped");
    }
}

async fn dispatch(
    mut events: broadcast::Receiver<BrokerEvent>,
    router: Arc<SymbolRouter<EventHandler>>,
    guard: Arc<PnlGuard>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                error!(skipped, "Event dispatcher lagged, broker events dropped");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let routed = match event {
            BrokerEvent::Tick(tick) => Some((tick.symbol.clone(), SymbolEvent::Tick(tick))),
            BrokerEvent::BarClosed(bar) => Some((bar.symbol.clone(), SymbolEvent::Bar(bar))),
            BrokerEvent::OrderStatus(update) => {
                Some((update.symbol.clone(), SymbolEvent::OrderStatus(update)))
            }
            BrokerEvent::Fill(fill) => Some((fill.symbol.clone(), SymbolEvent::Fill(fill))),
            BrokerEvent::Pnl(update) => {
                let guard = Arc::clone(&guard);
                tokio::spawn(async move {
                    if let Err(err) = guard.on_pnl_update(&update).await {
                        warn!(error = %err, "PnL guard evaluation failed");
                    }
                });
                None
            }
            BrokerEvent::Position(position) => {
                guard.on_position(&position);
                None
            }
            BrokerEvent::Disconnected => {
                warn!("Broker session dropped");
                None
            }
            BrokerEvent::Error {
                code,
                message,
                order_id,
            } => {
                warn!(code, message = %message, order_id = ?order_id, "Broker error");
                None
            }
        };
        if let Some((symbol, event)) = routed {
            if let Err(err) = router.route(&symbol, event) {
                debug!(error = %err, "Dropping event after shutdown");
                break;
            }
        }
    }
    debug!("Event dispatcher stopped");
}
