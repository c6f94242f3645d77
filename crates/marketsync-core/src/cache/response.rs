use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::policy::{CategoryTtlPolicy, TtlPolicy};
use crate::error::FetchError;
use crate::task::TaskGuard;

/// How often the background sweeper runs unless configured otherwise.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

type InFlight<V> = Shared<BoxFuture<'static, Result<V, FetchError>>>;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    data: V,
    cached_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.cached_at) < self.ttl
    }

    /// Swept once nobody has needed it for two TTL windows.
    fn is_sweepable(&self, now: Instant) -> bool {
        now.duration_since(self.cached_at) > self.ttl * 2
    }
}

struct State<V> {
    entries: HashMap<String, CacheEntry<V>>,
    in_flight: HashMap<String, InFlight<V>>,
}

struct Inner<V> {
    state: Mutex<State<V>>,
    policy: Arc<dyn TtlPolicy>,
}

impl<V: Clone> Inner<V> {
    fn complete(&self, key: &str, ttl: Duration, result: &anyhow::Result<V>) {
        let mut state = self.state.lock();
        state.in_flight.remove(key);
        match result {
            Ok(data) => {
                state.entries.insert(
                    key.to_string(),
                    CacheEntry {
                        data: data.clone(),
                        cached_at: Instant::now(),
                        ttl,
                    },
                );
            }
            Err(e) => debug!(key = key, error = %e, "Fetch failed, not caching"),
        }
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_sweepable(now));
        before - state.entries.len()
    }
}

/// TTL-scoped cache of the last successful read per key, with in-flight
/// deduplication: concurrent callers for the same key share one fetch.
///
/// Failures are never cached. Clone is cheap and every clone shares state.
pub struct ResponseCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for ResponseCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> Default for ResponseCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(Arc::new(CategoryTtlPolicy::default()))
    }
}

impl<V> ResponseCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(policy: Arc<dyn TtlPolicy>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    in_flight: HashMap::new(),
                }),
                policy,
            }),
        }
    }

    /// Read `key` with the TTL chosen by the cache's policy.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetcher: F) -> Result<V, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let ttl = self.inner.policy.ttl_for(key);
        self.get_or_fetch_with_ttl(key, ttl, fetcher).await
    }

    /// Read `key`, overriding the policy TTL for this call.
    ///
    /// `fetcher` is only invoked when there is neither a fresh entry nor a
    /// request already underway for `key`. The fetch runs as its own task, so
    /// it completes (and its result is cached) even if every caller gives up.
    pub async fn get_or_fetch_with_ttl<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetcher: F,
    ) -> Result<V, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let pending = {
            let mut state = self.inner.state.lock();

            if let Some(entry) = state.entries.get(key) {
                if entry.is_fresh(Instant::now()) {
                    trace!(key = key, "Cache hit");
                    return Ok(entry.data.clone());
                }
            }

            match state.in_flight.get(key) {
                Some(pending) => {
                    trace!(key = key, "Joining in-flight fetch");
                    pending.clone()
                }
                None => {
                    let pending = self.start_fetch(key, ttl, fetcher());
                    state.in_flight.insert(key.to_string(), pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    fn start_fetch<Fut>(&self, key: &str, ttl: Duration, fetch: Fut) -> InFlight<V>
    where
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        debug!(key = key, ttl_ms = ttl.as_millis() as u64, "Cache miss, fetching");

        let weak: Weak<Inner<V>> = Arc::downgrade(&self.inner);
        let task_key = key.to_string();
        let handle = tokio::spawn(async move {
            let result = fetch.await;
            if let Some(inner) = weak.upgrade() {
                inner.complete(&task_key, ttl, &result);
            }
            result.map_err(FetchError::failed)
        });

        let weak = Arc::downgrade(&self.inner);
        let join_key = key.to_string();
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    // The task died before it could clear its own marker.
                    debug!(key = %join_key, error = %e, "Fetch task aborted");
                    if let Some(inner) = weak.upgrade() {
                        inner.state.lock().in_flight.remove(&join_key);
                    }
                    Err(FetchError::Aborted)
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Evict entries older than twice their TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let removed = self.inner.sweep();
        if removed > 0 {
            debug!(removed = removed, "Swept expired cache entries");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the guard is dropped
    /// or every clone of the cache is gone.
    pub fn spawn_sweeper(&self, interval: Duration) -> TaskGuard {
        let weak = Arc::downgrade(&self.inner);
        TaskGuard::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let removed = inner.sweep();
                if removed > 0 {
                    debug!(removed = removed, "Swept expired cache entries");
                }
            }
        })
    }

    /// Drop the cached value for `key`. An in-flight fetch is left alone.
    pub fn invalidate(&self, key: &str) {
        self.inner.state.lock().entries.remove(key);
    }

    pub fn clear(&self) {
        self.inner.state.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.state.lock().in_flight.contains_key(key)
    }
}
