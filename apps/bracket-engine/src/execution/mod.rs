//! Trade execution: pricing, bracket lifecycle and per-symbol sequencing.

mod dedup;
mod machine;
mod outcome;
pub mod pricing;
mod router;

pub use dedup::{ClosedBrackets, FillDedup};
pub use machine::BracketMachine;
pub use outcome::{FillOutcome, IntentAck, IntentOutcome, TradePlan};
pub use pricing::PriceSource;
pub use router::{RouteError, SymbolEvent, SymbolHandler, SymbolRouter};
