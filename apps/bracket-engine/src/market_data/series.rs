//! Bounded, time-ascending bar series.

use std::collections::VecDeque;

use tracing::debug;

use crate::domain::Bar;

/// Ring buffer of closed bars, oldest first.
#[derive(Debug, Clone)]
pub struct BarSeries {
    bars: VecDeque<Bar>,
    capacity: usize,
}

impl BarSeries {
    /// Create an empty series holding at most `capacity` bars.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bars: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a closed bar.
    ///
    /// A bar with the same time as the newest one replaces it. Older bars are
    /// rejected so the series stays time-ascending. Returns whether the
    /// series changed.
    pub fn push(&mut self, bar: Bar) -> bool {
        match self.bars.back() {
            Some(last) if bar.time < last.time => {
                debug!(bar_time = %bar.time, last_time = %last.time, "Dropping out-of-order bar");
                return false;
            }
            Some(last) if bar.time == last.time => {
                self.bars.pop_back();
            }
            _ => {}
        }
        if self.bars.len() == self.capacity {
            self.bars.pop_front();
        }
        self.bars.push_back(bar);
        true
    }

    /// Replace the contents with `bars`, sorted and trimmed to capacity.
    pub fn reset(&mut self, mut bars: Vec<Bar>) {
        bars.sort_by_key(|b| b.time);
        bars.dedup_by_key(|b| b.time);
        let skip = bars.len().saturating_sub(self.capacity);
        self.bars = bars.into_iter().skip(skip).collect();
    }

    /// Bars as one slice, oldest first.
    pub fn as_slice(&mut self) -> &[Bar] {
        self.bars.make_contiguous()
    }

    /// Newest bar.
    #[must_use]
    pub fn last(&self) -> Option<&Bar> {
        self.bars.back()
    }

    /// Number of bars.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    /// Whether the series is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Retention bound.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(minute: i64, close: f64) -> Bar {
        Bar {
            time: Utc.with_ymd_and_hms(2024, 5, 1, 14, 0, 0).unwrap() + Duration::minutes(minute),
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut series = BarSeries::new(3);
        for i in 0..5 {
            assert!(series.push(bar(i, f64::from(u8::try_from(i).unwrap()))));
        }
        let closes: Vec<f64> = series.as_slice().iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn rejects_older_and_replaces_same_time() {
        let mut series = BarSeries::new(10);
        series.push(bar(5, 1.0));
        assert!(!series.push(bar(4, 2.0)));
        assert!(series.push(bar(5, 3.0)));
        assert_eq!(series.len(), 1);
        assert_eq!(series.last().unwrap().close, 3.0);
    }

    #[test]
    fn reset_sorts_and_trims() {
        let mut series = BarSeries::new(2);
        series.reset(vec![bar(3, 3.0), bar(1, 1.0), bar(2, 2.0)]);
        let closes: Vec<f64> = series.as_slice().iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![2.0, 3.0]);
    }
}
