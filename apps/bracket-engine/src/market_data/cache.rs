//! Market data cache.
//!
//! Reads clone an `Arc` of the latest published value. Writers build a new
//! value and swap it in, so a reader never observes a half-applied update.
//! Per-key writes are serialized by the map's entry lock, which gives
//! arrival-order application within one symbol.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OnceCell, broadcast};
use tracing::{debug, info};

use super::series::BarSeries;
use crate::broker::{BrokerSession, HistoricalBarsRequest, SessionError, WHAT_TO_SHOW};
use crate::config::IndicatorsConfig;
use crate::domain::{
    Bar, BarEvent, BarSize, Contract, IndicatorSnapshot, MarketSnapshot, Symbol, TickUpdate, Trend,
    VolatilityStopState,
};
use crate::indicators::{ema, volatility_stop, wilder_atr};

type SeriesKey = (Symbol, BarSize);

/// Owner of all market data state.
pub struct MarketDataCache {
    config: IndicatorsConfig,
    contracts: DashMap<Symbol, Arc<OnceCell<Contract>>>,
    snapshots: DashMap<Symbol, Arc<MarketSnapshot>>,
    series: DashMap<SeriesKey, BarSeries>,
    indicators: DashMap<SeriesKey, Arc<IndicatorSnapshot>>,
    tx: broadcast::Sender<Arc<IndicatorSnapshot>>,
}

impl std::fmt::Debug for MarketDataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataCache")
            .field("contracts", &self.contracts.len())
            .field("snapshots", &self.snapshots.len())
            .field("series", &self.series.len())
            .finish_non_exhaustive()
    }
}

impl MarketDataCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(config: IndicatorsConfig) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            config,
            contracts: DashMap::new(),
            snapshots: DashMap::new(),
            series: DashMap::new(),
            indicators: DashMap::new(),
            tx,
        }
    }

    /// Indicator settings.
    #[must_use]
    pub const fn config(&self) -> &IndicatorsConfig {
        &self.config
    }

    /// Subscribe to republished indicator snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<IndicatorSnapshot>> {
        self.tx.subscribe()
    }

    /// Qualified contract for `contract.symbol`, qualifying it at most once.
    ///
    /// Concurrent callers for the same symbol share one broker round-trip. A
    /// failed qualification is not memoized.
    ///
    /// # Errors
    ///
    /// Returns the session error from the qualification request.
    pub async fn qualify(
        &self,
        session: &BrokerSession,
        contract: &Contract,
    ) -> Result<Contract, SessionError> {
        let cell = Arc::clone(&self.contracts.entry(contract.symbol.clone()).or_default());
        let qualified = cell
            .get_or_try_init(|| async {
                let qualified = session.qualify_contract(contract).await?;
                info!(
                    symbol = %qualified.symbol,
                    con_id = ?qualified.con_id,
                    "Contract qualified"
                );
                Ok::<_, SessionError>(qualified)
            })
            .await?;
        Ok(qualified.clone())
    }

    /// Previously qualified contract.
    #[must_use]
    pub fn cached_contract(&self, symbol: &Symbol) -> Option<Contract> {
        self.contracts
            .get(symbol)
            .and_then(|cell| cell.get().cloned())
    }

    /// Merge a tick into the symbol's snapshot and publish the result.
    pub fn on_tick(&self, tick: &TickUpdate) -> Arc<MarketSnapshot> {
        let mut entry = self
            .snapshots
            .entry(tick.symbol.clone())
            .or_insert_with(|| Arc::new(MarketSnapshot::empty(tick.symbol.clone())));
        let next = Arc::new(entry.merged(tick));
        *entry = Arc::clone(&next);
        next
    }

    /// Append a closed bar, recompute indicators and publish them.
    ///
    /// Returns `None` if the bar was out of order and ignored.
    pub fn on_bar_close(&self, event: &BarEvent) -> Option<Arc<IndicatorSnapshot>> {
        let key = (event.symbol.clone(), event.bar_size);
        let snapshot = {
            let mut series = self
                .series
                .entry(key.clone())
                .or_insert_with(|| BarSeries::new(self.config.retention));
            if !series.push(event.bar) {
                return None;
            }
            let snapshot = Arc::new(self.compute(&event.symbol, event.bar_size, series.as_slice()));
            self.indicators.insert(key, Arc::clone(&snapshot));
            snapshot
        };
        self.publish(&snapshot);
        Some(snapshot)
    }

    /// Replace a series with historical bars and compute indicators.
    pub fn seed_bars(
        &self,
        symbol: &Symbol,
        bar_size: BarSize,
        bars: Vec<Bar>,
    ) -> Option<Arc<IndicatorSnapshot>> {
        let key = (symbol.clone(), bar_size);
        let snapshot = {
            let mut series = self
                .series
                .entry(key.clone())
                .or_insert_with(|| BarSeries::new(self.config.retention));
            series.reset(bars);
            if series.is_empty() {
                return None;
            }
            let snapshot = Arc::new(self.compute(symbol, bar_size, series.as_slice()));
            self.indicators.insert(key, Arc::clone(&snapshot));
            snapshot
        };
        self.publish(&snapshot);
        Some(snapshot)
    }

    /// Fetch history for a qualified contract and seed its series.
    ///
    /// Returns the number of bars loaded.
    ///
    /// # Errors
    ///
    /// Returns the session error from the history request.
    pub async fn warm_up(
        &self,
        session: &BrokerSession,
        contract: &Contract,
        bar_size: BarSize,
    ) -> Result<usize, SessionError> {
        let request = HistoricalBarsRequest {
            contract: contract.clone(),
            duration: self.config.history_duration.clone(),
            bar_size,
            what_to_show: WHAT_TO_SHOW.to_string(),
            use_rth: self.config.use_rth,
        };
        let bars = session.request_historical_bars(&request).await?;
        let count = bars.len();
        let snapshot = self.seed_bars(&contract.symbol, bar_size, bars);
        info!(
            symbol = %contract.symbol,
            bar_size = %bar_size,
            bars = count,
            vol_stop = ?snapshot.as_ref().and_then(|s| s.vol_stop.as_ref()).map(|v| v.stop),
            "Indicators warmed up"
        );
        Ok(count)
    }

    /// Whether a series exists for `symbol` at `bar_size`.
    #[must_use]
    pub fn has_series(&self, symbol: &Symbol, bar_size: BarSize) -> bool {
        self.series.contains_key(&(symbol.clone(), bar_size))
    }

    /// Latest quote snapshot.
    #[must_use]
    pub fn get_snapshot(&self, symbol: &Symbol) -> Option<Arc<MarketSnapshot>> {
        self.snapshots.get(symbol).map(|s| Arc::clone(&s))
    }

    /// Volatility stop on the configured default bar size.
    #[must_use]
    pub fn get_vol_stop(&self, symbol: &Symbol) -> Option<VolatilityStopState> {
        self.vol_stop_for(symbol, self.config.bar_size)
    }

    /// Volatility stop on a specific bar size.
    #[must_use]
    pub fn vol_stop_for(&self, symbol: &Symbol, bar_size: BarSize) -> Option<VolatilityStopState> {
        self.get_indicators(symbol, bar_size)
            .and_then(|s| s.vol_stop.clone())
    }

    /// Latest indicator snapshot.
    #[must_use]
    pub fn get_indicators(
        &self,
        symbol: &Symbol,
        bar_size: BarSize,
    ) -> Option<Arc<IndicatorSnapshot>> {
        self.indicators
            .get(&(symbol.clone(), bar_size))
            .map(|s| Arc::clone(&s))
    }

    /// Close of the newest bar.
    #[must_use]
    pub fn last_close(&self, symbol: &Symbol, bar_size: BarSize) -> Option<f64> {
        self.get_indicators(symbol, bar_size).map(|s| s.last_close)
    }

    fn publish(&self, snapshot: &Arc<IndicatorSnapshot>) {
        debug!(
            symbol = %snapshot.symbol,
            bar_size = %snapshot.bar_size,
            bars = snapshot.bars,
            trend = ?snapshot.trend(),
            "Indicators updated"
        );
        let _ = self.tx.send(Arc::clone(snapshot));
    }

    fn compute(&self, symbol: &Symbol, bar_size: BarSize, bars: &[Bar]) -> IndicatorSnapshot {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let last = bars.last().copied();
        let atr = wilder_atr(bars, self.config.atr_period)
            .last()
            .copied()
            .flatten();

        let vol_stop = volatility_stop(bars, self.config.atr_period, self.config.atr_multiplier)
            .last()
            .copied()
            .flatten()
            .zip(last)
            .map(|(point, bar)| VolatilityStopState {
                symbol: symbol.clone(),
                bar_size,
                stop: point.stop,
                trend: Trend::from_uptrend(point.uptrend),
                atr: point.atr,
                multiplier: self.config.atr_multiplier,
                close: bar.close,
                bar_time: bar.time,
            });

        let emas = self
            .config
            .ema_periods
            .iter()
            .filter_map(|&period| {
                ema(&closes, period)
                    .last()
                    .copied()
                    .flatten()
                    .map(|v| (period, v))
            })
            .collect();

        IndicatorSnapshot {
            symbol: symbol.clone(),
            bar_size,
            atr,
            vol_stop,
            emas,
            last_close: last.map_or(0.0, |b| b.close),
            bars: bars.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SessionSettings;
    use crate::paper::PaperGateway;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn config() -> IndicatorsConfig {
        IndicatorsConfig {
            atr_period: 3,
            ema_periods: vec![2, 3],
            retention: 50,
            ..IndicatorsConfig::default()
        }
    }

    fn bar(i: i64, close: f64) -> Bar {
        Bar {
            time: Utc.with_ymd_and_hms(2024, 6, 3, 13, 30, 0).unwrap() + Duration::minutes(5 * i),
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 100.0,
        }
    }

    fn event(i: i64, close: f64) -> BarEvent {
        BarEvent {
            symbol: Symbol::new("AAPL"),
            bar_size: BarSize::Min5,
            bar: bar(i, close),
        }
    }

    #[test]
    fn bar_close_publishes_vol_stop_after_warm_up() {
        let cache = MarketDataCache::new(config());
        let sym = Symbol::new("AAPL");
        cache.on_bar_close(&event(0, 100.0));
        cache.on_bar_close(&event(1, 101.0));
        assert!(cache.get_vol_stop(&sym).is_none());
        let snap = cache.on_bar_close(&event(2, 102.0)).unwrap();
        let stop = cache.get_vol_stop(&sym).unwrap();
        assert_eq!(stop.trend, Trend::Up);
        assert!(stop.stop < 102.0);
        assert_eq!(snap.bars, 3);
        assert!(snap.ema(2).is_some());
        assert!(snap.ema(3).is_some());
        assert_eq!(cache.last_close(&sym, BarSize::Min5), Some(102.0));
    }

    #[test]
    fn out_of_order_bar_is_ignored() {
        let cache = MarketDataCache::new(config());
        cache.on_bar_close(&event(5, 100.0));
        assert!(cache.on_bar_close(&event(4, 90.0)).is_none());
        assert_eq!(
            cache.last_close(&Symbol::new("AAPL"), BarSize::Min5),
            Some(100.0)
        );
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let cache = MarketDataCache::new(config());
        let mut tick = TickUpdate::new("AAPL");
        tick.bid = Some(100.0);
        cache.on_tick(&tick);
        let held = cache.get_snapshot(&Symbol::new("AAPL")).unwrap();
        tick.bid = Some(101.0);
        cache.on_tick(&tick);
        assert_eq!(held.bid, Some(100.0));
        assert_eq!(
            cache.get_snapshot(&Symbol::new("AAPL")).unwrap().bid,
            Some(101.0)
        );
    }

    #[test]
    fn nan_then_valid_bid() {
        let cache = MarketDataCache::new(config());
        let mut tick = TickUpdate::new("AAPL");
        tick.bid = Some(f64::NAN);
        cache.on_tick(&tick);
        tick.bid = Some(101.5);
        cache.on_tick(&tick);
        assert_eq!(
            cache.get_snapshot(&Symbol::new("AAPL")).unwrap().bid,
            Some(101.5)
        );
    }

    #[tokio::test]
    async fn qualifies_each_symbol_once() {
        let paper = Arc::new(PaperGateway::new());
        let session = BrokerSession::new(paper.clone(), SessionSettings::default());
        session.connect().await.unwrap();
        let cache = Arc::new(MarketDataCache::new(config()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move {
                cache.qualify(&session, &Contract::stock("AAPL")).await
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap().con_id);
        }
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        // A later unknown-symbol marking does not affect the memoized contract.
        paper.mark_unknown("AAPL");
        assert!(cache.qualify(&session, &Contract::stock("AAPL")).await.is_ok());
        assert!(cache.cached_contract(&Symbol::new("AAPL")).is_some());
    }

    #[tokio::test]
    async fn failed_qualification_is_retried() {
        let paper = Arc::new(PaperGateway::new());
        let session = BrokerSession::new(paper.clone(), SessionSettings::default());
        session.connect().await.unwrap();
        let cache = MarketDataCache::new(config());
        paper.mark_unknown("ZZZZ");
        assert!(cache.qualify(&session, &Contract::stock("ZZZZ")).await.is_err());
        assert!(cache.cached_contract(&Symbol::new("ZZZZ")).is_none());
    }

    #[tokio::test]
    async fn warm_up_seeds_series() {
        let paper = Arc::new(PaperGateway::new());
        paper.set_history("AAPL", (0..20).map(|i| bar(i, 100.0 + f64::from(u8::try_from(i).unwrap()))).collect());
        let session = BrokerSession::new(paper.clone(), SessionSettings::default());
        session.connect().await.unwrap();
        let cache = MarketDataCache::new(config());
        let contract = cache.qualify(&session, &Contract::stock("AAPL")).await.unwrap();
        let loaded = cache.warm_up(&session, &contract, BarSize::Min5).await.unwrap();
        assert_eq!(loaded, 20);
        assert!(cache.has_series(&contract.symbol, BarSize::Min5));
        assert!(cache.vol_stop_for(&contract.symbol, BarSize::Min5).is_some());
    }

    proptest! {
        #[test]
        fn invalid_ticks_never_replace_valid_fields(
            first in 1.0f64..1000.0,
            garbage in prop::sample::select(vec![f64::NAN, 0.0, -1.0, f64::INFINITY]),
        ) {
            let cache = MarketDataCache::new(config());
            let mut tick = TickUpdate::new("AAPL");
            tick.bid = Some(first);
            tick.last = Some(first);
            cache.on_tick(&tick);
            tick.bid = Some(garbage);
            tick.last = Some(garbage);
            let snap = cache.on_tick(&tick);
            prop_assert_eq!(snap.bid, Some(first));
            prop_assert_eq!(snap.last, Some(first));
        }
    }
}
