//! Market Data Cache & Indicator Engine.
//!
//! Single owner of per-symbol quote snapshots, bar series, qualified
//! contracts and derived indicators.

mod cache;
mod series;

pub use cache::MarketDataCache;
pub use series::BarSeries;
