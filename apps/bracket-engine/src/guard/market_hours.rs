//! US equity regular trading hours.

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::America::New_York;
use parking_lot::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    /// Clock frozen at `at`.
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(Mutex::new(at))
    }

    /// Move the clock.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.0.lock() = at;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

const fn session_open() -> NaiveTime {
    match NaiveTime::from_hms_opt(9, 30, 0) {
        Some(t) => t,
        None => NaiveTime::MIN,
    }
}

const fn session_close() -> NaiveTime {
    match NaiveTime::from_hms_opt(16, 0, 0) {
        Some(t) => t,
        None => NaiveTime::MIN,
    }
}

/// Whether `at` falls in 09:30-16:00 New York time on a weekday.
///
/// Exchange holidays are not modelled.
#[must_use]
pub fn is_regular_trading_hours(at: DateTime<Utc>) -> bool {
    let local = at.with_timezone(&New_York);
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let time = local.time();
    time >= session_open() && time < session_close()
}
