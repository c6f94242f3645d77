//! Adaptive polling of live data.
//!
//! - `market`: the market-session predicate that picks the polling cadence
//! - `refresh`: the stream registry and its timers

pub mod market;
pub mod refresh;

pub use market::{effective_interval, MarketSession, UsEquitySession, CLOSED_MARKET_MULTIPLIER};
pub use refresh::{FetchFn, RefreshScheduler, StreamStatus, StreamSubscription};
