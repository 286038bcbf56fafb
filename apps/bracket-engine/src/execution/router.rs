//! Per-symbol inboxes.
//!
//! Every event for a symbol goes through that symbol's queue and is handled
//! by one worker task, so ticks, bars, statuses, fills and intents for a
//! symbol are applied in arrival order. Different symbols proceed in
//! parallel.
//!
//! Routing never waits. Each inbox is a bounded channel; when a symbol's
//! worker falls behind and the channel fills, later events for that symbol
//! queue in its overflow until the worker catches up. Once the overflow holds
//! `capacity` events, the oldest queued quote tick is shed for each new tick.
//! Bars, statuses, fills and intents are never shed.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::domain::{BarEvent, FillEvent, OrderStatusUpdate, Symbol, TickUpdate, TradeIntent};
use crate::observability;

/// Work item for one symbol.
#[derive(Debug, Clone)]
pub enum SymbolEvent {
    /// Quote update.
    Tick(TickUpdate),
    /// Closed bar.
    Bar(BarEvent),
    /// Order status.
    OrderStatus(OrderStatusUpdate),
    /// Execution report.
    Fill(FillEvent),
    /// Accepted trade intent.
    Intent {
        /// Correlation id.
        intent_id: String,
        /// The intent.
        intent: Box<TradeIntent>,
    },
}

impl SymbolEvent {
    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Tick(_) => "tick",
            Self::Bar(_) => "bar",
            Self::OrderStatus(_) => "order_status",
            Self::Fill(_) => "fill",
            Self::Intent { .. } => "intent",
        }
    }

    const fn is_tick(&self) -> bool {
        matches!(self, Self::Tick(_))
    }
}

/// Consumer of routed events.
#[async_trait]
pub trait SymbolHandler: Send + Sync + 'static {
    /// Handle one event. Called sequentially per symbol.
    async fn handle(&self, symbol: &Symbol, event: SymbolEvent);
}

/// Routing failure.
#[derive(Debug, Clone, Error)]
pub enum RouteError {
    /// The router is shut down.
    #[error("symbol inbox closed for {0}")]
    Closed(Symbol),
}

type Overflow = Arc<Mutex<VecDeque<SymbolEvent>>>;

#[derive(Clone)]
struct Lane {
    tx: mpsc::Sender<SymbolEvent>,
    overflow: Overflow,
}

/// Router owning one inbox and worker per symbol.
pub struct SymbolRouter<H: SymbolHandler> {
    handler: Arc<H>,
    capacity: usize,
    lanes: DashMap<Symbol, Lane>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl<H: SymbolHandler> std::fmt::Debug for SymbolRouter<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolRouter")
            .field("symbols", &self.lanes.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl<H: SymbolHandler> SymbolRouter<H> {
    /// Create a router. Workers stop when `shutdown` is cancelled.
    #[must_use]
    pub fn new(handler: Arc<H>, capacity: usize, shutdown: CancellationToken) -> Self {
        Self {
            handler,
            capacity: capacity.max(1),
            lanes: DashMap::new(),
            workers: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Queue an event for the symbol without waiting.
    ///
    /// # Errors
    ///
    /// `Closed` after shutdown.
    pub fn route(&self, symbol: &Symbol, event: SymbolEvent) -> Result<(), RouteError> {
        if self.shutdown.is_cancelled() {
            return Err(RouteError::Closed(symbol.clone()));
        }
        trace!(symbol = %symbol, kind = event.kind(), "Routing event");
        let lane = self.lane(symbol);
        let mut overflow = lane.overflow.lock();
        // Anything already in overflow is newer than the whole channel.
        let event = if overflow.is_empty() {
            match lane.tx.try_send(event) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(event)) => {
                    warn!(symbol = %symbol, capacity = self.capacity, "Symbol inbox full, queueing in overflow");
                    event
                }
                Err(TrySendError::Closed(_)) => return Err(RouteError::Closed(symbol.clone())),
            }
        } else {
            event
        };
        if event.is_tick() && overflow.len() >= self.capacity {
            if let Some(stale) = overflow.iter().position(SymbolEvent::is_tick) {
                overflow.remove(stale);
                observability::record_tick_shed(symbol.as_str());
            }
        }
        overflow.push_back(event);
        observability::record_inbox_overflow(symbol.as_str());
        Ok(())
    }

    /// Events waiting in the symbol's overflow.
    #[must_use]
    pub fn backlog(&self, symbol: &Symbol) -> usize {
        self.lanes
            .get(symbol)
            .map_or(0, |lane| lane.overflow.lock().len())
    }

    fn lane(&self, symbol: &Symbol) -> Lane {
        self.lanes
            .entry(symbol.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.capacity);
                let overflow = Overflow::default();
                let worker = tokio::spawn(run_inbox(
                    symbol.clone(),
                    Arc::clone(&self.handler),
                    rx,
                    Arc::clone(&overflow),
                    self.shutdown.clone(),
                ));
                self.workers.lock().push(worker);
                debug!(symbol = %symbol, "Symbol inbox opened");
                Lane { tx, overflow }
            })
            .clone()
    }

    /// Symbols with an open inbox.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.lanes.iter().map(|e| e.key().clone()).collect()
    }

    /// Stop accepting events and wait for workers to finish their current item.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.lanes.clear();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for result in futures::future::join_all(workers).await {
            if let Err(err) = result {
                debug!(error = %err, "Symbol worker ended abnormally");
            }
        }
    }
}

async fn run_inbox<H: SymbolHandler>(
    symbol: Symbol,
    handler: Arc<H>,
    mut rx: mpsc::Receiver<SymbolEvent>,
    overflow: Overflow,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let queued = match rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => overflow.lock().pop_front(),
            Err(TryRecvError::Disconnected) => break,
        };
        let event = match queued {
            Some(event) => event,
            None => tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            },
        };
        handler.handle(&symbol, event).await;
    }
    debug!(symbol = %symbol, "Symbol inbox closed");
}
