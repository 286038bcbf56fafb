//! Broker Session Manager
//!
//! Owns the single long-lived gateway session:
//!
//! - `connect()` retries a fixed number of times with a fixed delay and fails
//!   with [`SessionError::ConnectionExhausted`] after the cap
//! - every request is serialized onto the session and bounded by a timeout
//! - an event pump re-publishes gateway events on a session-owned broadcast
//!   channel so subscribers survive reconnects
//! - an unsolicited disconnect waits `reconnect_delay`, reconnects and
//!   re-requests realtime bar and PnL subscriptions
//! - `disconnect()` sets the shutting-down flag first, so an in-flight
//!   reconnect loop exits instead of racing a fresh connection

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::port::{AccountSummary, BrokerError, BrokerEvent, BrokerGateway, HistoricalBarsRequest};
use super::retry::ConnectPolicy;
use crate::domain::{
    Bar, BarSize, BrokerPosition, Contract, OpenOrder, OrderAck, OrderId, OrderRequest,
};
use crate::observability;

const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected.
    Disconnected,
    /// Initial connection in progress.
    Connecting,
    /// Connected.
    Connected,
    /// Reconnecting after an unsolicited disconnect.
    Reconnecting,
    /// Deliberate shutdown in progress.
    ShuttingDown,
    /// Connection attempts exhausted.
    Exhausted,
}

/// Session error.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// Connect attempts exhausted.
    #[error("connection exhausted after {attempts} attempts")]
    ConnectionExhausted {
        /// Attempts made.
        attempts: u32,
    },

    /// Session is shutting down.
    #[error("session is shutting down")]
    ShuttingDown,

    /// Gateway error.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Session timing parameters.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Connect attempt cap.
    pub connect_attempts: u32,
    /// Delay between connect attempts.
    pub connect_retry_delay: Duration,
    /// Wait after an unsolicited disconnect before reconnecting.
    pub reconnect_delay: Duration,
    /// Bound on every request round-trip.
    pub request_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            connect_retry_delay: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
struct Subscriptions {
    realtime_bars: HashSet<(Contract, BarSize)>,
    pnl_account: Option<String>,
}

/// Broker session manager.
pub struct BrokerSession {
    gateway: Arc<dyn BrokerGateway>,
    settings: SessionSettings,
    request_lock: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
    shutdown: CancellationToken,
    state_tx: watch::Sender<SessionState>,
    events_tx: broadcast::Sender<BrokerEvent>,
    subscriptions: Mutex<Subscriptions>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("state", &*self.state_tx.borrow())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl BrokerSession {
    /// Create a session over a gateway. Nothing connects until [`Self::connect`].
    #[must_use]
    pub fn new(gateway: Arc<dyn BrokerGateway>, settings: SessionSettings) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            gateway,
            settings,
            request_lock: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            state_tx,
            events_tx,
            subscriptions: Mutex::new(Subscriptions::default()),
            pump: Mutex::new(None),
        })
    }

    /// Connect with bounded retry and start the event pump.
    ///
    /// # Errors
    ///
    /// `ConnectionExhausted` after the attempt cap, `ShuttingDown` if
    /// [`Self::disconnect`] was called.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        let events = self.gateway.events();
        self.connect_with_retry(SessionState::Connecting).await?;
        self.start_pump(events);
        Ok(())
    }

    /// Shut the session down. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns the gateway error if closing the connection failed.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Disconnect already in progress");
            return Ok(());
        }
        self.state_tx.send_replace(SessionState::ShuttingDown);
        self.shutdown.cancel();
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
        }

        let result = if self.gateway.is_connected() {
            self.gateway.disconnect().await
        } else {
            Ok(())
        };
        self.state_tx.send_replace(SessionState::Disconnected);
        info!("Broker session closed");
        result.map_err(SessionError::from)
    }

    /// Whether a deliberate shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Whether the gateway reports an open session.
    pub fn is_connected(&self) -> bool {
        self.gateway.is_connected()
    }

    /// Watch the session state.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to broker events.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events_tx.subscribe()
    }

    /// Qualify a contract.
    pub async fn qualify_contract(&self, contract: &Contract) -> Result<Contract, SessionError> {
        self.request("qualify_contract", self.gateway.qualify_contract(contract))
            .await
    }

    /// Place an order.
    pub async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, SessionError> {
        self.request("place_order", self.gateway.place_order(order))
            .await
    }

    /// Cancel an order.
    pub async fn cancel_order(&self, order_id: OrderId) -> Result<(), SessionError> {
        self.request("cancel_order", self.gateway.cancel_order(order_id))
            .await
    }

    /// Fetch historical bars.
    pub async fn request_historical_bars(
        &self,
        request: &HistoricalBarsRequest,
    ) -> Result<Vec<Bar>, SessionError> {
        self.request(
            "request_historical_bars",
            self.gateway.request_historical_bars(request),
        )
        .await
    }

    /// Subscribe to realtime bars. The subscription is renewed after reconnects.
    pub async fn request_realtime_bars(
        &self,
        contract: &Contract,
        bar_size: BarSize,
    ) -> Result<(), SessionError> {
        self.request(
            "request_realtime_bars",
            self.gateway.request_realtime_bars(contract, bar_size),
        )
        .await?;
        self.subscriptions
            .lock()
            .realtime_bars
            .insert((contract.clone(), bar_size));
        Ok(())
    }

    /// Snapshot of broker positions.
    pub async fn request_positions(&self) -> Result<Vec<BrokerPosition>, SessionError> {
        self.request("request_positions", self.gateway.request_positions())
            .await
    }

    /// Snapshot of broker working orders.
    pub async fn request_open_orders(&self) -> Result<Vec<OpenOrder>, SessionError> {
        self.request("request_open_orders", self.gateway.request_open_orders())
            .await
    }

    /// Subscribe to account PnL. The subscription is renewed after reconnects.
    pub async fn request_pnl(&self, account: &str) -> Result<(), SessionError> {
        self.request("request_pnl", self.gateway.request_pnl(account))
            .await?;
        self.subscriptions.lock().pnl_account = Some(account.to_string());
        Ok(())
    }

    /// Account balances.
    pub async fn request_account_summary(&self) -> Result<AccountSummary, SessionError> {
        self.request(
            "request_account_summary",
            self.gateway.request_account_summary(),
        )
        .await
    }

    /// Run one gateway round-trip with serialization and a timeout.
    async fn request<T, F>(&self, operation: &'static str, call: F) -> Result<T, SessionError>
    where
        F: Future<Output = Result<T, BrokerError>> + Send,
    {
        if self.is_shutting_down() {
            return Err(SessionError::ShuttingDown);
        }
        let _guard = self.request_lock.lock().await;
        match tokio::time::timeout(self.settings.request_timeout, call).await {
            Ok(result) => result.map_err(SessionError::from),
            Err(_) => {
                warn!(operation, "Broker request timed out");
                Err(BrokerError::Timeout {
                    operation,
                    timeout_ms: u64::try_from(self.settings.request_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                }
                .into())
            }
        }
    }

    async fn connect_with_retry(&self, state: SessionState) -> Result<(), SessionError> {
        let mut policy = ConnectPolicy::new(
            self.settings.connect_attempts,
            self.settings.connect_retry_delay,
        );

        while policy.begin_attempt() {
            if self.is_shutting_down() {
                return Err(SessionError::ShuttingDown);
            }
            self.state_tx.send_replace(state);
            info!(
                attempt = policy.current_attempt(),
                max_attempts = policy.max_attempts(),
                "Connecting to broker"
            );

            match tokio::time::timeout(self.settings.request_timeout, self.gateway.connect()).await
            {
                Ok(Ok(())) => {
                    self.state_tx.send_replace(SessionState::Connected);
                    info!(attempt = policy.current_attempt(), "Broker session connected");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(attempt = policy.current_attempt(), error = %e, "Connect attempt failed");
                }
                Err(_) => {
                    warn!(attempt = policy.current_attempt(), "Connect attempt timed out");
                }
            }

            if let Some(delay) = policy.next_delay() {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = self.shutdown.cancelled() => return Err(SessionError::ShuttingDown),
                }
            }
        }

        let attempts = policy.current_attempt();
        self.state_tx.send_replace(SessionState::Exhausted);
        error!(attempts, "Broker connection attempts exhausted");
        Err(SessionError::ConnectionExhausted { attempts })
    }

    fn start_pump(self: &Arc<Self>, events: broadcast::Receiver<BrokerEvent>) {
        let mut slot = self.pump.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let session = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { session.pump(events).await }));
    }

    async fn pump(self: Arc<Self>, mut events: broadcast::Receiver<BrokerEvent>) {
        loop {
            let event = tokio::select! {
                () = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(BrokerEvent::Disconnected) => {
                    let _ = self.events_tx.send(BrokerEvent::Disconnected);
                    if self.is_shutting_down() {
                        break;
                    }
                    if !self.reconnect().await {
                        break;
                    }
                }
                Ok(event) => {
                    let _ = self.events_tx.send(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Broker event pump lagged");
                }
                Err(RecvError::Closed) => {
                    debug!("Gateway event channel closed");
                    break;
                }
            }
        }
        debug!("Broker event pump stopped");
    }

    /// Returns `false` when the pump should stop.
    async fn reconnect(&self) -> bool {
        self.state_tx.send_replace(SessionState::Reconnecting);
        warn!(
            delay_ms = self.settings.reconnect_delay.as_millis(),
            "Unsolicited disconnect, scheduling reconnect"
        );

        tokio::select! {
            () = tokio::time::sleep(self.settings.reconnect_delay) => {}
            () = self.shutdown.cancelled() => return false,
        }
        if self.is_shutting_down() {
            return false;
        }

        match self.connect_with_retry(SessionState::Reconnecting).await {
            Ok(()) => {
                observability::record_reconnect();
                self.resubscribe().await;
                true
            }
            Err(e) => {
                error!(error = %e, "Reconnect failed");
                false
            }
        }
    }

    async fn resubscribe(&self) {
        let (bars, pnl) = {
            let subs = self.subscriptions.lock();
            (
                subs.realtime_bars.iter().cloned().collect::<Vec<_>>(),
                subs.pnl_account.clone(),
            )
        };
        for (contract, bar_size) in bars {
            if let Err(e) = self.request_realtime_bars(&contract, bar_size).await {
                warn!(symbol = %contract.symbol, error = %e, "Failed to renew bar subscription");
            }
        }
        if let Some(account) = pnl {
            if let Err(e) = self.request_pnl(&account).await {
                warn!(account, error = %e, "Failed to renew PnL subscription");
            }
        }
        info!("Subscriptions renewed after reconnect");
    }
}
