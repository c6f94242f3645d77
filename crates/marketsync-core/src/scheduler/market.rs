use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

use crate::config::Config;

/// Polling slows down by this factor while the market is closed.
pub const CLOSED_MARKET_MULTIPLIER: u32 = 5;

/// Whether the market is trading at a given instant.
pub trait MarketSession: Send + Sync {
    fn is_open(&self, at: DateTime<Utc>) -> bool;
}

impl<F> MarketSession for F
where
    F: Fn(DateTime<Utc>) -> bool + Send + Sync,
{
    fn is_open(&self, at: DateTime<Utc>) -> bool {
        self(at)
    }
}

/// Regular US equity session: weekdays inside a fixed UTC minute window.
///
/// The default window is 14:30–21:00 UTC, i.e. 09:30–16:00 Eastern standard
/// time. Daylight saving shifts and exchange holidays are not modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsEquitySession {
    pub open_minute: u32,
    pub close_minute: u32,
}

impl Default for UsEquitySession {
    fn default() -> Self {
        Self {
            open_minute: 14 * 60 + 30,
            close_minute: 21 * 60,
        }
    }
}

impl UsEquitySession {
    pub fn from_config(config: &Config) -> Self {
        Self {
            open_minute: config.market_open_minute_utc,
            close_minute: config.market_close_minute_utc,
        }
    }
}

impl MarketSession for UsEquitySession {
    fn is_open(&self, at: DateTime<Utc>) -> bool {
        if matches!(at.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let minute = at.hour() * 60 + at.minute();
        minute >= self.open_minute && minute < self.close_minute
    }
}

pub fn effective_interval(base: Duration, market_open: bool) -> Duration {
    if market_open {
        base
    } else {
        base * CLOSED_MARKET_MULTIPLIER
    }
}
