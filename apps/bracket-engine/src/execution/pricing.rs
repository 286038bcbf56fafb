//! Entry and stop price resolution.
//!
//! Entry priority: intent price, then the live quote on the side being taken
//! (ask for a buy, bid for a sell), then last trade, then the last bar close.
//!
//! Stop priority: intent stop, then the stop named by the intent's stop type.
//! A volatility stop is pushed `epsilon` further from price so it does not
//! trigger on the first tick. A volatility stop on the wrong side of entry
//! (trend disagrees with the trade) falls back to an ATR stop.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;

use crate::domain::{Action, IndicatorSnapshot, MarketSnapshot, StopType, TradeIntent};
use crate::error::EngineError;

/// Where a resolved price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    /// Supplied by the intent.
    Intent,
    /// Live bid or ask.
    Quote,
    /// Last trade.
    Last,
    /// Close of the newest bar.
    BarClose,
    /// Volatility stop.
    VolatilityStop,
    /// ATR distance from entry.
    Atr,
}

/// Round to cents.
#[must_use]
pub fn round_price(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert a feed value to a cent-rounded price.
#[must_use]
pub fn to_price(value: f64) -> Option<Decimal> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    Decimal::from_f64(value).map(round_price)
}

/// Resolve the entry price.
///
/// # Errors
///
/// `PRICE_UNAVAILABLE` when nothing in the chain has a usable value.
pub fn resolve_entry_price(
    intent: &TradeIntent,
    snapshot: Option<&MarketSnapshot>,
    last_close: Option<f64>,
) -> Result<(Decimal, PriceSource), EngineError> {
    if let Some(price) = intent.explicit_entry() {
        return Ok((round_price(price), PriceSource::Intent));
    }
    if let Some(snapshot) = snapshot {
        let quote = match intent.action {
            Action::Buy => snapshot.ask,
            Action::Sell => snapshot.bid,
        };
        if let Some(price) = quote.and_then(to_price) {
            return Ok((price, PriceSource::Quote));
        }
        if let Some(price) = snapshot.last.and_then(to_price) {
            return Ok((price, PriceSource::Last));
        }
    }
    if let Some(price) = last_close.and_then(to_price) {
        return Ok((price, PriceSource::BarClose));
    }
    Err(EngineError::price_unavailable(intent.ticker.as_str()))
}

fn on_protective_side(action: Action, stop: Decimal, entry: Decimal) -> bool {
    stop > Decimal::ZERO
        && match action {
            Action::Buy => stop < entry,
            Action::Sell => stop > entry,
        }
}

/// Stop offset from a volatility stop level.
#[must_use]
pub fn offset_vol_stop(level: f64, action: Action, epsilon: Decimal) -> Option<Decimal> {
    let level = Decimal::from_f64(level)?;
    let stop = match action {
        Action::Buy => level - epsilon,
        Action::Sell => level + epsilon,
    };
    Some(round_price(stop))
}

/// Stop at `ATR * multiplier` from `entry`.
#[must_use]
pub fn atr_stop(entry: Decimal, atr: f64, multiplier: f64, action: Action) -> Option<Decimal> {
    let distance = Decimal::from_f64(atr * multiplier)?;
    let stop = match action {
        Action::Buy => entry - distance,
        Action::Sell => entry + distance,
    };
    Some(round_price(stop))
}

/// Derive a stop from indicators only, ignoring any intent stop.
#[must_use]
pub fn indicator_stop(
    stop_type: StopType,
    action: Action,
    entry: Decimal,
    indicators: Option<&IndicatorSnapshot>,
    epsilon: Decimal,
) -> Option<(Decimal, PriceSource)> {
    let indicators = indicators?;
    let atr = || {
        let vol = indicators.vol_stop.as_ref();
        let multiplier = vol.map_or(1.0, |v| v.multiplier);
        indicators
            .atr
            .and_then(|a| atr_stop(entry, a, multiplier, action))
            .filter(|s| on_protective_side(action, *s, entry))
            .map(|s| (s, PriceSource::Atr))
    };

    match stop_type {
        StopType::VolatilityStop => indicators
            .vol_stop
            .as_ref()
            .and_then(|v| offset_vol_stop(v.stop, action, epsilon))
            .filter(|s| on_protective_side(action, *s, entry))
            .map(|s| (s, PriceSource::VolatilityStop))
            .or_else(|| {
                debug!(symbol = %indicators.symbol, "Volatility stop unusable, trying ATR stop");
                atr()
            }),
        StopType::Atr => atr(),
        StopType::Explicit => None,
    }
}

/// Resolve the stop price for an entry.
///
/// # Errors
///
/// `INVALID_INPUT` when an explicit stop is on the wrong side of entry,
/// `PRICE_UNAVAILABLE` when no indicator stop can be derived.
pub fn resolve_stop(
    intent: &TradeIntent,
    entry: Decimal,
    indicators: Option<&IndicatorSnapshot>,
    epsilon: Decimal,
) -> Result<(Decimal, PriceSource), EngineError> {
    if let Some(stop) = intent.explicit_stop() {
        let stop = round_price(stop);
        if !on_protective_side(intent.action, stop, entry) {
            return Err(EngineError::invalid_input(format!(
                "stop {stop} is on the wrong side of entry {entry} for {}",
                intent.action
            ))
            .with_context("symbol", &intent.ticker));
        }
        return Ok((stop, PriceSource::Intent));
    }
    indicator_stop(intent.stop_type, intent.action, entry, indicators, epsilon).ok_or_else(|| {
        EngineError::new(
            crate::error::ErrorCode::PriceUnavailable,
            format!("no stop level available for {}", intent.ticker),
        )
        .with_context("symbol", &intent.ticker)
    })
}

/// Stop for a bracket against the actual fill price.
///
/// Tries, in order: the intent stop, a fresh indicator stop, the planned
/// stop. Falls back to the planned per-share risk if none of them protect
/// the fill.
#[must_use]
pub fn bracket_stop(
    intent: &TradeIntent,
    fill_price: Decimal,
    planned_stop: Decimal,
    planned_risk: Decimal,
    indicators: Option<&IndicatorSnapshot>,
    epsilon: Decimal,
) -> Decimal {
    let action = intent.action;
    let fresh = indicator_stop(intent.stop_type, action, fill_price, indicators, epsilon)
        .map(|(s, _)| s);
    [intent.explicit_stop().map(round_price), fresh, Some(planned_stop)]
        .into_iter()
        .flatten()
        .find(|s| on_protective_side(action, *s, fill_price))
        .unwrap_or_else(|| {
            round_price(match action {
                Action::Buy => fill_price - planned_risk,
                Action::Sell => fill_price + planned_risk,
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BarSize, Symbol, Trend, VolatilityStopState};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use test_case::test_case;

    fn snapshot(bid: Option<f64>, ask: Option<f64>, last: Option<f64>) -> MarketSnapshot {
        MarketSnapshot {
            bid,
            ask,
            last,
            ..MarketSnapshot::empty(Symbol::new("AAPL"))
        }
    }

    fn indicators(stop: f64, trend: Trend, atr: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            symbol: Symbol::new("AAPL"),
            bar_size: BarSize::Min5,
            atr: Some(atr),
            vol_stop: Some(VolatilityStopState {
                symbol: Symbol::new("AAPL"),
                bar_size: BarSize::Min5,
                stop,
                trend,
                atr,
                multiplier: 1.5,
                close: 100.0,
                bar_time: Utc::now(),
            }),
            emas: Vec::new(),
            last_close: 100.0,
            bars: 50,
        }
    }

    #[test_case(Action::Buy, Some(dec!(99.5)), Some(100.10), Some(100.20), Some(100.15), Some(100.0), dec!(99.5), PriceSource::Intent ; "intent wins")]
    #[test_case(Action::Buy, None, Some(100.10), Some(100.20), Some(100.15), Some(100.0), dec!(100.20), PriceSource::Quote ; "buy takes ask")]
    #[test_case(Action::Sell, None, Some(100.10), Some(100.20), Some(100.15), Some(100.0), dec!(100.10), PriceSource::Quote ; "sell takes bid")]
    #[test_case(Action::Buy, None, Some(100.10), None, Some(100.15), Some(100.0), dec!(100.15), PriceSource::Last ; "missing ask falls to last")]
    #[test_case(Action::Buy, None, None, Some(f64::NAN), None, Some(100.0), dec!(100.00), PriceSource::BarClose ; "falls to bar close")]
    #[allow(clippy::too_many_arguments)]
    fn entry_price_chain(
        action: Action,
        intent_price: Option<Decimal>,
        bid: Option<f64>,
        ask: Option<f64>,
        last: Option<f64>,
        close: Option<f64>,
        want: Decimal,
        source: PriceSource,
    ) {
        let mut intent = TradeIntent::new("AAPL", action);
        intent.entry_price = intent_price;
        let snap = snapshot(bid, ask, last);
        let (price, got) = resolve_entry_price(&intent, Some(&snap), close).unwrap();
        assert_eq!(price, want);
        assert_eq!(got, source);
    }

    #[test]
    fn no_price_anywhere() {
        let intent = TradeIntent::new("AAPL", Action::Buy);
        let err = resolve_entry_price(&intent, None, None).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::PriceUnavailable);
    }

    #[test]
    fn vol_stop_is_offset_away_from_price() {
        let intent = TradeIntent::new("AAPL", Action::Buy);
        let ind = indicators(97.0, Trend::Up, 2.0);
        let (stop, source) = resolve_stop(&intent, dec!(100), Some(&ind), dec!(0.01)).unwrap();
        assert_eq!(stop, dec!(96.99));
        assert_eq!(source, PriceSource::VolatilityStop);

        let intent = TradeIntent::new("AAPL", Action::Sell);
        let ind = indicators(103.0, Trend::Down, 2.0);
        let (stop, _) = resolve_stop(&intent, dec!(100), Some(&ind), dec!(0.01)).unwrap();
        assert_eq!(stop, dec!(103.01));
    }

    #[test]
    fn wrong_side_vol_stop_falls_back_to_atr() {
        let intent = TradeIntent::new("AAPL", Action::Buy);
        // downtrend stop sits above price
        let ind = indicators(104.0, Trend::Down, 2.0);
        let (stop, source) = resolve_stop(&intent, dec!(100), Some(&ind), dec!(0.01)).unwrap();
        assert_eq!(source, PriceSource::Atr);
        assert_eq!(stop, dec!(97.00));
    }

    #[test]
    fn explicit_stop_must_protect() {
        let mut intent = TradeIntent::new("AAPL", Action::Buy);
        intent.stop_loss = Some(dec!(101));
        let err = resolve_stop(&intent, dec!(100), None, dec!(0.01)).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidInput);
    }

    #[test]
    fn missing_indicators_is_unavailable() {
        let intent = TradeIntent::new("AAPL", Action::Buy);
        let err = resolve_stop(&intent, dec!(100), None, dec!(0.01)).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::PriceUnavailable);
    }

    #[test]
    fn bracket_stop_recomputes_against_fill() {
        let intent = TradeIntent::new("AAPL", Action::Buy);
        let ind = indicators(98.0, Trend::Up, 2.0);
        let stop = bracket_stop(&intent, dec!(101), dec!(97), dec!(3), Some(&ind), dec!(0.01));
        assert_eq!(stop, dec!(97.99));

        // fill gapped below every candidate
        let stop = bracket_stop(&intent, dec!(90), dec!(97), dec!(3), Some(&ind), dec!(0.01));
        assert_eq!(stop, dec!(87.00));
    }
}
