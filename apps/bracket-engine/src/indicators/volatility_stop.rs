//! Volatility stop (vStop).
//!
//! A trailing stop at `ATR * multiplier` from the running extreme close of
//! the current trend. While up, the stop only rises; while down, it only
//! falls. The trend flips when the close crosses the stop, and the stop then
//! restarts at `close -/+ ATR * multiplier` for the new trend.

use super::atr::wilder_atr;
use crate::domain::Bar;

/// vStop output for one bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolStopPoint {
    /// Stop level.
    pub stop: f64,
    /// Close above the stop.
    pub uptrend: bool,
    /// ATR before the multiplier.
    pub atr: f64,
    /// Trend changed on this bar.
    pub flipped: bool,
}

#[derive(Debug, Clone, Copy)]
struct Trail {
    max: f64,
    min: f64,
    stop: f64,
    uptrend: bool,
}

/// vStop series aligned with `bars`. Starts once ATR is available, in an
/// uptrend.
#[must_use]
pub fn volatility_stop(bars: &[Bar], period: usize, multiplier: f64) -> Vec<Option<VolStopPoint>> {
    let atr = wilder_atr(bars, period);
    let mut out = vec![None; bars.len()];
    let mut trail: Option<Trail> = None;

    for (i, bar) in bars.iter().enumerate() {
        let Some(a) = atr[i] else { continue };
        let close = bar.close;
        let atr_m = a * multiplier;

        let (next, flipped) = match trail {
            None => (
                Trail {
                    max: close,
                    min: close,
                    stop: close - atr_m,
                    uptrend: true,
                },
                false,
            ),
            Some(prev) => {
                let max = prev.max.max(close);
                let min = prev.min.min(close);
                let stop = if prev.uptrend {
                    prev.stop.max(max - atr_m)
                } else {
                    prev.stop.min(min + atr_m)
                };
                let uptrend = close - stop >= 0.0;
                if uptrend == prev.uptrend {
                    (
                        Trail {
                            max,
                            min,
                            stop,
                            uptrend,
                        },
                        false,
                    )
                } else {
                    let stop = if uptrend { close - atr_m } else { close + atr_m };
                    (
                        Trail {
                            max: close,
                            min: close,
                            stop,
                            uptrend,
                        },
                        true,
                    )
                }
            }
        };

        out[i] = Some(VolStopPoint {
            stop: next.stop,
            uptrend: next.uptrend,
            atr: a,
            flipped,
        });
        trail = Some(next);
    }
    out
}
