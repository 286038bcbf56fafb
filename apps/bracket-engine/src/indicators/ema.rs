//! Exponential moving average, seeded with the simple mean of the first
//! `period` values. Alpha = 2 / (period + 1).

/// EMA series over `values`.
#[must_use]
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    #[allow(clippy::cast_precision_loss)]
    let p = period as f64;
    let alpha = 2.0 / (p + 1.0);

    let mut current = values[..period].iter().sum::<f64>() / p;
    out[period - 1] = Some(current);
    for i in period..values.len() {
        current = alpha.mul_add(values[i] - current, current);
        out[i] = Some(current);
    }
    out
}

/// Last EMA value, if there is enough history.
#[must_use]
pub fn latest_ema(values: &[f64], period: usize) -> Option<f64> {
    ema(values, period).last().copied().flatten()
}
