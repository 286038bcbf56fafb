//! Average True Range.
//!
//! TR[0] = high - low. TR[t] = max(high - low, |high - prev_close|, |low - prev_close|).
//! ATR is Wilder-smoothed (alpha = 1/period), seeded with the mean of the
//! first `period` true ranges.

use crate::domain::Bar;

/// True range series.
#[must_use]
pub fn true_range(bars: &[Bar]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(bars.len());
    for (i, bar) in bars.iter().enumerate() {
        let range = bar.high - bar.low;
        if i == 0 {
            tr.push(range);
        } else {
            let prev_close = bars[i - 1].close;
            tr.push(
                range
                    .max((bar.high - prev_close).abs())
                    .max((bar.low - prev_close).abs()),
            );
        }
    }
    tr
}

/// Wilder ATR series. Values start at index `period - 1`.
#[must_use]
pub fn wilder_atr(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    if period == 0 || bars.len() < period {
        return out;
    }
    let tr = true_range(bars);
    #[allow(clippy::cast_precision_loss)]
    let p = period as f64;

    let mut atr = tr[..period].iter().sum::<f64>() / p;
    out[period - 1] = Some(atr);
    for i in period..tr.len() {
        atr = atr.mul_add(p - 1.0, tr[i]) / p;
        out[i] = Some(atr);
    }
    out
}
