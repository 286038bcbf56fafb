//! Indicator math over closed bars.
//!
//! All functions are pure and operate on time-ascending slices. Outputs are
//! aligned with the input: index `i` is the value as of bar `i`, `None`
//! during warm-up.

pub mod atr;
pub mod ema;
pub mod volatility_stop;

pub use atr::{true_range, wilder_atr};
pub use ema::{ema, latest_ema};
pub use volatility_stop::{VolStopPoint, volatility_stop};
