use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::market::{effective_interval, MarketSession, UsEquitySession};
use crate::clock::{Clock, SystemClock};
use crate::task::TaskGuard;

/// A stream's fetch function. It receives a token that is cancelled when the
/// fetch is superseded; a superseded future is also dropped by the scheduler.
pub type FetchFn =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct InFlight {
    seq: u64,
    token: CancellationToken,
}

struct Stream {
    generation: u64,
    fetch_fn: FetchFn,
    base_interval: Duration,
    timer: Option<TaskGuard>,
    in_flight: Option<InFlight>,
    fetch_seq: u64,
    last_fetch_at: Option<Instant>,
    error_count: u32,
    last_error: Option<String>,
}

impl Stream {
    fn cancel_in_flight(&mut self) {
        if let Some(previous) = self.in_flight.take() {
            previous.token.cancel();
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.cancel_in_flight();
    }
}

/// Point-in-time view of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStatus {
    pub key: String,
    pub base_interval: Duration,
    pub last_fetch_at: Option<Instant>,
    /// Consecutive failed fetches; reset by the next success.
    pub error_count: u32,
    pub last_error: Option<String>,
    pub is_fetching: bool,
    pub is_polling: bool,
}

struct State {
    streams: HashMap<String, Stream>,
    paused: bool,
}

struct Inner {
    state: Mutex<State>,
    session: Arc<dyn MarketSession>,
    clock: Arc<dyn Clock>,
    next_generation: AtomicU64,
}

impl Inner {
    fn interval_for(&self, base: Duration) -> Duration {
        effective_interval(base, self.session.is_open(self.clock.now()))
    }

    /// Start a fetch for `key`, superseding whatever is in flight for it.
    fn start_fetch(self: &Arc<Self>, key: &str) {
        let (generation, seq, token, fetch_fn) = {
            let mut state = self.state.lock();
            let Some(stream) = state.streams.get_mut(key) else {
                return;
            };
            stream.cancel_in_flight();
            stream.fetch_seq += 1;
            let token = CancellationToken::new();
            stream.in_flight = Some(InFlight {
                seq: stream.fetch_seq,
                token: token.clone(),
            });
            (
                stream.generation,
                stream.fetch_seq,
                token,
                stream.fetch_fn.clone(),
            )
        };

        trace!(key = key, seq = seq, "Starting stream fetch");
        let fetch = fetch_fn(token.clone());
        let weak = Arc::downgrade(self);
        let key = key.to_string();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    trace!(key = %key, seq = seq, "Stream fetch superseded");
                    return;
                }
                result = fetch => result,
            };
            if let Some(inner) = weak.upgrade() {
                inner.finish_fetch(&key, generation, seq, result);
            }
        });
    }

    fn finish_fetch(&self, key: &str, generation: u64, seq: u64, result: anyhow::Result<()>) {
        let mut state = self.state.lock();
        let Some(stream) = state.streams.get_mut(key) else {
            return;
        };
        let current = stream.generation == generation
            && stream.in_flight.as_ref().is_some_and(|f| f.seq == seq);
        if !current {
            return;
        }
        stream.in_flight = None;

        match result {
            Ok(()) => {
                stream.last_fetch_at = Some(Instant::now());
                stream.error_count = 0;
                stream.last_error = None;
            }
            Err(e) => {
                stream.error_count += 1;
                debug!(
                    key = key,
                    error_count = stream.error_count,
                    error = %e,
                    "Stream fetch failed"
                );
                stream.last_error = Some(e.to_string());
            }
        }
    }

    fn spawn_timer(self: &Arc<Self>, key: &str, generation: u64, base: Duration) -> TaskGuard {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let key = key.to_string();
        TaskGuard::spawn(async move {
            loop {
                let interval = match weak.upgrade() {
                    Some(inner) => inner.interval_for(base),
                    None => break,
                };
                tokio::time::sleep(interval).await;

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let live = inner
                    .state
                    .lock()
                    .streams
                    .get(&key)
                    .is_some_and(|s| s.generation == generation);
                if !live {
                    break;
                }
                inner.start_fetch(&key);
            }
        })
    }
}

/// Owns a set of named polling streams.
///
/// Each stream fetches once on subscribe, then on a timer whose period is the
/// base interval while the market is open and five times that otherwise. A
/// new fetch for a stream always supersedes the previous one.
#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<Inner>,
}

impl Default for RefreshScheduler {
    fn default() -> Self {
        Self::new(Arc::new(UsEquitySession::default()), Arc::new(SystemClock))
    }
}

impl RefreshScheduler {
    pub fn new(session: Arc<dyn MarketSession>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    streams: HashMap::new(),
                    paused: false,
                }),
                session,
                clock,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Register `key`, replacing any stream already registered under it.
    pub fn subscribe<F, Fut>(
        &self,
        key: impl Into<String>,
        fetch: F,
        base_interval: Duration,
    ) -> StreamSubscription
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let fetch_fn: FetchFn = Arc::new(move |token| fetch(token).boxed());
        self.subscribe_boxed(key.into(), fetch_fn, base_interval)
    }

    pub fn subscribe_boxed(
        &self,
        key: String,
        fetch_fn: FetchFn,
        base_interval: Duration,
    ) -> StreamSubscription {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let replaced = {
            let mut state = self.inner.state.lock();
            let timer = if state.paused {
                None
            } else {
                Some(self.inner.spawn_timer(&key, generation, base_interval))
            };
            state.streams.insert(
                key.clone(),
                Stream {
                    generation,
                    fetch_fn,
                    base_interval,
                    timer,
                    in_flight: None,
                    fetch_seq: 0,
                    last_fetch_at: None,
                    error_count: 0,
                    last_error: None,
                },
            )
        };
        // Dropping the old stream aborts its timer and cancels its fetch
        if replaced.is_some() {
            debug!(key = %key, "Replaced existing stream");
        }
        drop(replaced);

        debug!(key = %key, interval_ms = base_interval.as_millis() as u64, "Stream subscribed");
        self.inner.start_fetch(&key);

        StreamSubscription {
            key,
            generation,
            scheduler: Arc::downgrade(&self.inner),
        }
    }

    pub fn unsubscribe(&self, key: &str) {
        let removed = self.inner.state.lock().streams.remove(key);
        if removed.is_some() {
            debug!(key = key, "Stream unsubscribed");
        }
    }

    /// Stop every timer. Fetches already underway are left to finish.
    pub fn pause(&self) {
        let mut state = self.inner.state.lock();
        if state.paused {
            return;
        }
        state.paused = true;
        for stream in state.streams.values_mut() {
            if let Some(mut timer) = stream.timer.take() {
                timer.cancel();
            }
        }
        debug!(streams = state.streams.len(), "Scheduler paused");
    }

    /// Restart every timer, and fetch right away for streams whose data is
    /// older than one interval.
    pub fn resume(&self) {
        let catch_up: Vec<String> = {
            let mut state = self.inner.state.lock();
            if !state.paused {
                return;
            }
            state.paused = false;

            let now = Instant::now();
            let mut stale = Vec::new();
            for (key, stream) in state.streams.iter_mut() {
                stream.timer = Some(self.inner.spawn_timer(
                    key,
                    stream.generation,
                    stream.base_interval,
                ));
                let interval = self.inner.interval_for(stream.base_interval);
                let is_stale = stream
                    .last_fetch_at
                    .map_or(true, |at| now.duration_since(at) >= interval);
                if is_stale && stream.in_flight.is_none() {
                    stale.push(key.clone());
                }
            }
            debug!(
                streams = state.streams.len(),
                catch_up = stale.len(),
                "Scheduler resumed"
            );
            stale
        };

        for key in catch_up {
            self.inner.start_fetch(&key);
        }
    }

    /// Fetch `key` now without touching its timer.
    pub fn refresh(&self, key: &str) {
        self.inner.start_fetch(key);
    }

    pub fn refresh_all(&self) {
        for key in self.stream_keys() {
            self.inner.start_fetch(&key);
        }
    }

    /// Unsubscribe every stream. Safe to call repeatedly.
    pub fn destroy(&self) {
        let streams: Vec<Stream> = {
            let mut state = self.inner.state.lock();
            state.streams.drain().map(|(_, s)| s).collect()
        };
        if !streams.is_empty() {
            debug!(streams = streams.len(), "Scheduler destroyed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    pub fn stream_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.state.lock().streams.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stream_status(&self, key: &str) -> Option<StreamStatus> {
        let state = self.inner.state.lock();
        state.streams.get(key).map(|s| StreamStatus {
            key: key.to_string(),
            base_interval: s.base_interval,
            last_fetch_at: s.last_fetch_at,
            error_count: s.error_count,
            last_error: s.last_error.clone(),
            is_fetching: s.in_flight.is_some(),
            is_polling: s.timer.as_ref().is_some_and(TaskGuard::is_active),
        })
    }
}

/// Handle returned by [`RefreshScheduler::subscribe`].
///
/// Unsubscribing through a handle only affects the subscription that created
/// it; once the key has been re-subscribed the old handle does nothing.
#[derive(Debug, Clone)]
pub struct StreamSubscription {
    key: String,
    generation: u64,
    scheduler: Weak<Inner>,
}

impl StreamSubscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn unsubscribe(self) {
        let Some(inner) = self.scheduler.upgrade() else {
            return;
        };
        let mut state = inner.state.lock();
        if state
            .streams
            .get(&self.key)
            .is_some_and(|s| s.generation == self.generation)
        {
            let removed = state.streams.remove(&self.key);
            drop(state);
            drop(removed);
            debug!(key = %self.key, "Stream unsubscribed");
        }
    }
}
