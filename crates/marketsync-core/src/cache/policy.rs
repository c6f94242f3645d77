use std::time::Duration;

use crate::config::Config;

/// Semantic class of cached data; decides how long a read stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataCategory {
    /// Prices and quotes.
    Live,
    /// Lists and feeds (watchlists, news, signals).
    Feed,
    /// Slow-changing reference data (profiles, instrument metadata).
    Reference,
}

impl DataCategory {
    /// Classify a cache key by its namespace, the part before the first `:`.
    pub fn of_key(key: &str) -> Self {
        let namespace = key.split(':').next().unwrap_or_default();
        match namespace {
            "quote" | "quotes" | "price" | "prices" | "chart" | "ticker" => DataCategory::Live,
            "feed" | "news" | "list" | "watchlist" | "signals" | "movers" => DataCategory::Feed,
            _ => DataCategory::Reference,
        }
    }
}

/// Pure mapping from cache key to TTL.
pub trait TtlPolicy: Send + Sync {
    fn ttl_for(&self, key: &str) -> Duration;
}

impl<F> TtlPolicy for F
where
    F: Fn(&str) -> Duration + Send + Sync,
{
    fn ttl_for(&self, key: &str) -> Duration {
        self(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryTtlPolicy {
    pub live: Duration,
    pub feed: Duration,
    pub reference: Duration,
}

impl Default for CategoryTtlPolicy {
    fn default() -> Self {
        Self {
            live: Duration::from_secs(15),
            feed: Duration::from_secs(30),
            reference: Duration::from_secs(5 * 60),
        }
    }
}

impl CategoryTtlPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            live: Duration::from_secs(config.live_ttl_secs),
            feed: Duration::from_secs(config.feed_ttl_secs),
            reference: Duration::from_secs(config.reference_ttl_secs),
        }
    }

    pub fn ttl(&self, category: DataCategory) -> Duration {
        match category {
            DataCategory::Live => self.live,
            DataCategory::Feed => self.feed,
            DataCategory::Reference => self.reference,
        }
    }
}

impl TtlPolicy for CategoryTtlPolicy {
    fn ttl_for(&self, key: &str) -> Duration {
        self.ttl(DataCategory::of_key(key))
    }
}
