//! Contracts and market data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::shared::Symbol;

/// Broker security type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SecurityType {
    /// Equity.
    #[default]
    #[serde(rename = "STK")]
    Stock,
    /// Future.
    #[serde(rename = "FUT")]
    Future,
    /// Currency pair.
    #[serde(rename = "CASH")]
    Forex,
    /// Crypto.
    #[serde(rename = "CRYPTO")]
    Crypto,
}

impl SecurityType {
    /// Broker wire code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Stock => "STK",
            Self::Future => "FUT",
            Self::Forex => "CASH",
            Self::Crypto => "CRYPTO",
        }
    }
}

/// A tradeable instrument.
///
/// `con_id` is only present once the broker has qualified the contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contract {
    /// Symbol.
    pub symbol: Symbol,
    /// Security type.
    pub sec_type: SecurityType,
    /// Routing exchange.
    pub exchange: String,
    /// Currency.
    pub currency: String,
    /// Broker-assigned contract id.
    pub con_id: Option<i64>,
}

impl Contract {
    /// SMART-routed USD stock.
    #[must_use]
    pub fn stock(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            sec_type: SecurityType::Stock,
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
            con_id: None,
        }
    }

    /// Whether the broker has resolved this contract.
    #[must_use]
    pub const fn is_qualified(&self) -> bool {
        self.con_id.is_some()
    }

    /// Copy of this contract carrying the broker id.
    #[must_use]
    pub fn qualified(&self, con_id: i64) -> Self {
        Self {
            con_id: Some(con_id),
            ..self.clone()
        }
    }
}

/// A streaming quote update. Absent fields were not part of the tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickUpdate {
    /// Symbol.
    pub symbol: Symbol,
    /// Best bid.
    pub bid: Option<f64>,
    /// Best ask.
    pub ask: Option<f64>,
    /// Last trade.
    pub last: Option<f64>,
    /// Mark price.
    pub mark: Option<f64>,
    /// Session volume.
    pub volume: Option<f64>,
    /// Halted flag.
    pub halted: Option<bool>,
    /// Shortable shares.
    pub shortable_shares: Option<f64>,
    /// Event time.
    pub time: Option<DateTime<Utc>>,
}

impl TickUpdate {
    /// Empty tick for `symbol`.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Self::default()
        }
    }
}

/// Latest quote state for one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Symbol.
    pub symbol: Symbol,
    /// Best bid.
    pub bid: Option<f64>,
    /// Best ask.
    pub ask: Option<f64>,
    /// Last trade.
    pub last: Option<f64>,
    /// Mark price.
    pub mark: Option<f64>,
    /// Session volume.
    pub volume: Option<f64>,
    /// Trading halted.
    pub halted: bool,
    /// Shortable shares.
    pub shortable_shares: Option<f64>,
    /// Both sides of the book are known.
    pub has_bid_ask: bool,
    /// Time of the last accepted update.
    pub updated_at: Option<DateTime<Utc>>,
}

/// A usable feed value: finite and strictly positive.
fn well_formed(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

impl MarketSnapshot {
    /// Empty snapshot for `symbol`.
    #[must_use]
    pub fn empty(symbol: Symbol) -> Self {
        Self {
            symbol,
            ..Self::default()
        }
    }

    /// Merge a tick, keeping previous values wherever the tick carries garbage.
    #[must_use]
    pub fn merged(&self, tick: &TickUpdate) -> Self {
        let mut next = self.clone();
        let mut touched = false;
        for (slot, incoming) in [
            (&mut next.bid, tick.bid),
            (&mut next.ask, tick.ask),
            (&mut next.last, tick.last),
            (&mut next.mark, tick.mark),
            (&mut next.volume, tick.volume),
            (&mut next.shortable_shares, tick.shortable_shares),
        ] {
            if let Some(value) = well_formed(incoming) {
                *slot = Some(value);
                touched = true;
            }
        }
        if let Some(halted) = tick.halted {
            next.halted = halted;
            touched = true;
        }
        next.has_bid_ask = next.bid.is_some() && next.ask.is_some();
        if touched {
            next.updated_at = Some(tick.time.unwrap_or_else(Utc::now));
        }
        next
    }

    /// Midpoint of bid and ask, if both are known.
    #[must_use]
    pub fn midpoint(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some(f64::midpoint(bid, ask)),
            _ => None,
        }
    }
}

/// Historical or realtime bar size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BarSize {
    /// 5 seconds (realtime bar granularity).
    #[serde(rename = "5 secs")]
    Sec5,
    /// 1 minute.
    #[serde(rename = "1 min")]
    Min1,
    /// 5 minutes.
    #[default]
    #[serde(rename = "5 mins")]
    Min5,
    /// 15 minutes.
    #[serde(rename = "15 mins")]
    Min15,
    /// 1 hour.
    #[serde(rename = "1 hour")]
    Hour1,
    /// 1 day.
    #[serde(rename = "1 day")]
    Day1,
}

impl BarSize {
    /// Broker wire string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sec5 => "5 secs",
            Self::Min1 => "1 min",
            Self::Min5 => "5 mins",
            Self::Min15 => "15 mins",
            Self::Hour1 => "1 hour",
            Self::Day1 => "1 day",
        }
    }

    /// Bar length in seconds.
    #[must_use]
    pub const fn seconds(&self) -> u64 {
        match self {
            Self::Sec5 => 5,
            Self::Min1 => 60,
            Self::Min5 => 300,
            Self::Min15 => 900,
            Self::Hour1 => 3600,
            Self::Day1 => 86_400,
        }
    }
}

impl fmt::Display for BarSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time.
    pub time: DateTime<Utc>,
    /// Open.
    pub open: f64,
    /// High.
    pub high: f64,
    /// Low.
    pub low: f64,
    /// Close.
    pub close: f64,
    /// Volume.
    pub volume: f64,
}

/// A closed bar for a symbol and bar size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarEvent {
    /// Symbol.
    pub symbol: Symbol,
    /// Bar size.
    pub bar_size: BarSize,
    /// The bar.
    pub bar: Bar,
}

/// Trend direction of the volatility stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    /// Price above the stop.
    Up,
    /// Price below the stop.
    Down,
}

impl Trend {
    /// From the vStop `uptrend` flag.
    #[must_use]
    pub const fn from_uptrend(uptrend: bool) -> Self {
        if uptrend { Self::Up } else { Self::Down }
    }

    /// Whether this is an uptrend.
    #[must_use]
    pub const fn is_up(&self) -> bool {
        matches!(self, Self::Up)
    }
}

/// Published volatility stop for one symbol and bar size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityStopState {
    /// Symbol.
    pub symbol: Symbol,
    /// Bar size the stop was computed on.
    pub bar_size: BarSize,
    /// Current stop level.
    pub stop: f64,
    /// Trend direction.
    pub trend: Trend,
    /// Current ATR (before the multiplier).
    pub atr: f64,
    /// ATR multiplier in effect.
    pub multiplier: f64,
    /// Close of the bar the stop was computed on.
    pub close: f64,
    /// Time of that bar.
    pub bar_time: DateTime<Utc>,
}

/// Everything derived from one bar series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    /// Symbol.
    pub symbol: Symbol,
    /// Bar size.
    pub bar_size: BarSize,
    /// Last ATR value.
    pub atr: Option<f64>,
    /// Volatility stop, once enough bars exist.
    pub vol_stop: Option<VolatilityStopState>,
    /// `(period, value)` for each configured EMA with enough history.
    pub emas: Vec<(usize, f64)>,
    /// Close of the latest bar.
    pub last_close: f64,
    /// Number of bars in the series.
    pub bars: usize,
}

impl IndicatorSnapshot {
    /// Trend of the volatility stop, if computed.
    #[must_use]
    pub fn trend(&self) -> Option<Trend> {
        self.vol_stop.as_ref().map(|v| v.trend)
    }

    /// EMA value for `period`.
    #[must_use]
    pub fn ema(&self, period: usize) -> Option<f64> {
        self.emas
            .iter()
            .find(|(p, _)| *p == period)
            .map(|(_, v)| *v)
    }
}
