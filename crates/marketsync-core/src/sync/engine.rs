//! Write-through queue.
//!
//! Callers apply a mutation locally, then hand it to [`SyncEngine::sync_to_cloud`]
//! and move on. The engine persists the write, then mirrors queued writes to
//! the backend one at a time in enqueue order. A failed write is retried on a
//! fixed backoff schedule and dropped after [`MAX_RETRIES`](super::MAX_RETRIES) attempts.
//!
//! Writes requested while signed out are not queued at all.
//! [`SyncEngine::sync_all_to_cloud`] queues a batch as one unit and says
//! whether it was accepted, for callers that must not lose part of a batch.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::queue::{backoff_delay, QueuedWrite, WriteMethod, WriteRequest};
use super::status::{AppLifecycle, FlushOutcome, FlushReport, SkipReason, SyncStatus};
use crate::api::{RemoteApi, UserDataApi, UserDataSnapshot};
use crate::auth::AuthProvider;
use crate::clock::Clock;
use crate::error::SyncError;
use crate::storage::KeyValueStore;
use crate::task::TaskGuard;

/// Store key holding the queue as a JSON array.
pub const QUEUE_KEY: &str = "marketsync.sync_queue";

/// Store key holding the RFC 3339 time of the last successful write.
pub const LAST_SYNCED_KEY: &str = "marketsync.last_synced_at";

/// Collaborators the engine is built from.
pub struct SyncDeps {
    pub store: Arc<dyn KeyValueStore>,
    pub remote: Arc<dyn RemoteApi>,
    pub auth: Arc<dyn AuthProvider>,
    pub clock: Arc<dyn Clock>,
    /// Network reachability, pushed by the host.
    pub network: watch::Receiver<bool>,
    pub lifecycle: watch::Receiver<AppLifecycle>,
}

#[derive(Default)]
struct EngineState {
    queue: Vec<QueuedWrite>,
    last_synced_at: Option<DateTime<Utc>>,
    is_authenticated: bool,
    /// Set once the host calls `set_authenticated`; its answer then wins
    /// over the provider's during `initialize`.
    auth_set_by_host: bool,
    is_syncing: bool,
    retry_timer: Option<TaskGuard>,
    watchers: Vec<TaskGuard>,
    destroyed: bool,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    api: UserDataApi,
    auth: Arc<dyn AuthProvider>,
    clock: Arc<dyn Clock>,
    network: watch::Receiver<bool>,
    lifecycle: watch::Receiver<AppLifecycle>,
    state: Mutex<EngineState>,
    status: watch::Sender<SyncStatus>,
    /// Serializes store writes so a slow write never lands after a newer one.
    persist_lock: tokio::sync::Mutex<()>,
}

/// Per-entry outcome of one flush attempt.
enum Attempt {
    Completed,
    Retry(u32),
    Dropped,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(deps: SyncDeps) -> Self {
        let is_online = *deps.network.borrow();
        let (status, _) = watch::channel(SyncStatus {
            is_online,
            ..SyncStatus::default()
        });

        Self {
            inner: Arc::new(Inner {
                store: deps.store,
                api: UserDataApi::new(deps.remote),
                auth: deps.auth,
                clock: deps.clock,
                network: deps.network,
                lifecycle: deps.lifecycle,
                state: Mutex::new(EngineState::default()),
                status,
                persist_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Load persisted state, start watching network and lifecycle signals,
    /// and flush if there is anything to send.
    pub async fn initialize(&self) -> Option<JoinHandle<FlushOutcome>> {
        let persisted = self.load_queue().await;
        let last_synced_at = self.load_last_synced_at().await;
        let is_authenticated = self.inner.auth.current_session().await.is_some();

        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return None;
            }
            // Anything enqueued before initialize finished goes after the
            // persisted entries.
            let mut queue = persisted;
            let known: HashSet<String> = queue.iter().map(|w| w.id.clone()).collect();
            queue.extend(state.queue.drain(..).filter(|w| !known.contains(&w.id)));
            state.queue = queue;
            if state.last_synced_at.is_none() {
                state.last_synced_at = last_synced_at;
            }
            if !state.auth_set_by_host {
                state.is_authenticated = is_authenticated;
            }

            if state.watchers.is_empty() {
                state.watchers.push(self.spawn_network_watcher());
                state.watchers.push(self.spawn_lifecycle_watcher());
            }
            info!(
                pending = state.queue.len(),
                authenticated = state.is_authenticated,
                "Sync engine initialized"
            );
        }
        self.publish_status();

        let ready = {
            let state = self.inner.state.lock();
            state.is_authenticated && !state.queue.is_empty()
        };
        if ready && self.is_online() {
            Some(self.spawn_flush())
        } else {
            None
        }
    }

    /// Record whether a session exists. Signing in triggers a flush.
    pub fn set_authenticated(&self, authenticated: bool) -> Option<JoinHandle<FlushOutcome>> {
        let became_authenticated = {
            let mut state = self.inner.state.lock();
            let was = state.is_authenticated;
            state.is_authenticated = authenticated;
            state.auth_set_by_host = true;
            !was && authenticated
        };
        self.publish_status();

        if became_authenticated {
            debug!("Authenticated, flushing write queue");
            Some(self.spawn_flush())
        } else {
            None
        }
    }

    /// Queue a write for the backend.
    ///
    /// Never fails from the caller's point of view. When signed out this is a
    /// no-op. The returned handle belongs to the flush this call started, if
    /// any, and exists only for observation.
    pub async fn sync_to_cloud(
        &self,
        endpoint: impl Into<String>,
        method: WriteMethod,
        payload: Value,
    ) -> Option<JoinHandle<FlushOutcome>> {
        let request = WriteRequest::new(endpoint, method, payload);
        if !self.enqueue(vec![request]).await {
            return None;
        }
        self.is_online().then(|| self.spawn_flush())
    }

    /// Queue several writes as one unit. Either all of them are queued or,
    /// when signed out, none are; the return value says which.
    pub async fn sync_all_to_cloud(&self, requests: Vec<WriteRequest>) -> bool {
        if !self.enqueue(requests).await {
            return false;
        }
        if self.is_online() {
            self.spawn_flush();
        }
        true
    }

    async fn enqueue(&self, requests: Vec<WriteRequest>) -> bool {
        {
            let mut state = self.inner.state.lock();
            if !state.is_authenticated {
                debug!(writes = requests.len(), "Not authenticated, writes stay local");
                return false;
            }
            let now = self.inner.clock.now();
            for request in requests {
                let write = QueuedWrite::new(request.endpoint, request.method, request.payload, now);
                debug!(id = %write.id, endpoint = %write.endpoint, method = ?write.method, "Queued write");
                state.queue.push(write);
            }
        }
        self.publish_status();
        self.persist_queue().await;
        true
    }

    /// Run one pass over a snapshot of the queue.
    ///
    /// Entries are sent one at a time in enqueue order and each is observed to
    /// completion before the next starts.
    pub async fn flush_queue(&self) -> FlushOutcome {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if state.is_syncing {
                return FlushOutcome::Skipped(SkipReason::AlreadyFlushing);
            }
            if !self.is_online() {
                return FlushOutcome::Skipped(SkipReason::Offline);
            }
            if !state.is_authenticated {
                return FlushOutcome::Skipped(SkipReason::Unauthenticated);
            }
            if state.queue.is_empty() {
                return FlushOutcome::Skipped(SkipReason::EmptyQueue);
            }
            state.is_syncing = true;
            // This pass covers whatever the timer would have retried
            if let Some(mut timer) = state.retry_timer.take() {
                timer.cancel();
            }
            state.queue.clone()
        };
        self.publish_status();
        debug!(entries = snapshot.len(), "Flushing write queue");

        let mut report = FlushReport::default();
        let mut outcomes: HashMap<String, Attempt> = HashMap::new();

        for (position, entry) in snapshot.iter().enumerate() {
            match self
                .inner
                .api
                .apply(&entry.endpoint, entry.method, entry.payload.clone())
                .await
            {
                Ok(()) => {
                    report.completed += 1;
                    outcomes.insert(entry.id.clone(), Attempt::Completed);
                }
                Err(SyncError::UnknownOperation(endpoint)) => {
                    warn!(id = %entry.id, endpoint = %endpoint, "Dropping write for unknown endpoint");
                    report.dropped += 1;
                    outcomes.insert(entry.id.clone(), Attempt::Dropped);
                }
                Err(e) if e.is_network_unavailable() && !self.is_online() => {
                    // Went offline mid-pass: leave this and every later entry
                    // for the reconnect
                    debug!(id = %entry.id, error = %e, "Network unavailable, pausing flush");
                    report.deferred = snapshot.len() - position;
                    break;
                }
                Err(e) => {
                    let mut failed = entry.clone();
                    let keep = failed.record_failure();
                    let attempts = failed.retry_count;
                    if !keep {
                        let dropped = SyncError::MaxRetriesExceeded {
                            id: entry.id.clone(),
                            attempts,
                        };
                        warn!(
                            endpoint = %entry.endpoint,
                            last_error = %e,
                            "{}", dropped
                        );
                        report.dropped += 1;
                        outcomes.insert(entry.id.clone(), Attempt::Dropped);
                    } else {
                        debug!(
                            id = %entry.id,
                            attempts = attempts,
                            error = %e,
                            "Write failed, will retry"
                        );
                        report.retrying += 1;
                        outcomes.insert(entry.id.clone(), Attempt::Retry(attempts));
                    }
                }
            }
        }

        report.attempted = report.completed + report.retrying + report.dropped;

        let snapshot_ids: HashSet<&str> = snapshot.iter().map(|w| w.id.as_str()).collect();
        let (timestamp_changed, follow_up) = {
            let mut state = self.inner.state.lock();
            state.queue.retain_mut(|write| match outcomes.get(&write.id) {
                Some(Attempt::Completed) | Some(Attempt::Dropped) => false,
                Some(Attempt::Retry(attempts)) => {
                    write.retry_count = *attempts;
                    true
                }
                None => true,
            });

            let timestamp_changed = report.completed > 0;
            if timestamp_changed {
                state.last_synced_at = Some(self.inner.clock.now());
            }

            let max_retry = outcomes
                .values()
                .filter_map(|a| match a {
                    Attempt::Retry(n) => Some(*n),
                    _ => None,
                })
                .max();
            if let Some(max_retry) = max_retry {
                if !state.destroyed {
                    let delay = backoff_delay(max_retry);
                    report.next_retry_in = Some(delay);
                    state.retry_timer = Some(self.spawn_retry_timer(delay));
                }
            }

            let enqueued_meanwhile = state
                .queue
                .iter()
                .any(|w| !snapshot_ids.contains(w.id.as_str()));
            let follow_up = enqueued_meanwhile
                && report.retrying == 0
                && report.deferred == 0
                && !state.destroyed;
            (timestamp_changed, follow_up)
        };

        self.persist_queue().await;
        if timestamp_changed {
            self.persist_last_synced_at().await;
        }

        self.inner.state.lock().is_syncing = false;
        self.publish_status();

        debug!(
            completed = report.completed,
            retrying = report.retrying,
            dropped = report.dropped,
            deferred = report.deferred,
            "Flush pass finished"
        );

        if follow_up {
            debug!("Writes queued during flush, running another pass");
            self.spawn_flush();
        }

        FlushOutcome::Completed(report)
    }

    /// Pull the latest server copy of every user-data category in parallel.
    /// A category that fails comes back as `None`.
    pub async fn fetch_all_user_data(&self) -> UserDataSnapshot {
        if !self.inner.state.lock().is_authenticated {
            debug!("Not authenticated, skipping user data fetch");
            return UserDataSnapshot::default();
        }
        self.inner.api.fetch_all().await
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    /// Observe status changes. The receiver already holds the current status.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn pending_writes(&self) -> Vec<QueuedWrite> {
        self.inner.state.lock().queue.clone()
    }

    /// Stop watching signals and cancel the retry timer. Idempotent.
    pub fn destroy(&self) {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        if let Some(mut timer) = state.retry_timer.take() {
            timer.cancel();
        }
        for mut watcher in state.watchers.drain(..) {
            watcher.cancel();
        }
        debug!("Sync engine destroyed");
    }

    fn is_online(&self) -> bool {
        *self.inner.network.borrow()
    }

    fn spawn_flush(&self) -> JoinHandle<FlushOutcome> {
        let engine = self.clone();
        tokio::spawn(async move { engine.flush_queue().await })
    }

    fn spawn_retry_timer(&self, delay: std::time::Duration) -> TaskGuard {
        let weak = Arc::downgrade(&self.inner);
        debug!(delay_ms = delay.as_millis() as u64, "Scheduling queue retry");
        TaskGuard::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                // The flush clears this timer, so it runs as its own task
                SyncEngine::from_inner(inner).spawn_flush();
            }
        })
    }

    fn spawn_network_watcher(&self) -> TaskGuard {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let mut network = self.inner.network.clone();
        let mut was_online = *network.borrow_and_update();
        TaskGuard::spawn(async move {
            while network.changed().await.is_ok() {
                let online = *network.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let engine = SyncEngine::from_inner(inner);
                engine.publish_status();
                if online && !was_online {
                    debug!("Back online, flushing write queue");
                    engine.spawn_flush();
                }
                was_online = online;
            }
        })
    }

    fn spawn_lifecycle_watcher(&self) -> TaskGuard {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let mut lifecycle = self.inner.lifecycle.clone();
        let _ = lifecycle.borrow_and_update();
        TaskGuard::spawn(async move {
            while lifecycle.changed().await.is_ok() {
                let state = *lifecycle.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let engine = SyncEngine::from_inner(inner);
                if state.is_active() && engine.pending_count() > 0 {
                    debug!("App active, flushing write queue");
                    engine.spawn_flush();
                }
            }
        })
    }

    fn publish_status(&self) {
        let status = {
            let state = self.inner.state.lock();
            SyncStatus {
                pending_count: state.queue.len(),
                is_syncing: state.is_syncing,
                last_synced_at: state.last_synced_at,
                is_online: self.is_online(),
                is_authenticated: state.is_authenticated,
            }
        };
        self.inner.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    // ===== Persistence =====
    //
    // Every failure here is logged and swallowed; the engine keeps working
    // from memory.

    async fn load_queue(&self) -> Vec<QueuedWrite> {
        match self.inner.store.get(QUEUE_KEY).await {
            Ok(Some(json)) => match serde_json::from_str::<Vec<QueuedWrite>>(&json) {
                Ok(queue) => queue,
                Err(e) => {
                    warn!(error = %SyncError::Persistence(e.to_string()), "Discarding unreadable write queue");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %SyncError::Persistence(e.to_string()), "Failed to load write queue");
                Vec::new()
            }
        }
    }

    async fn load_last_synced_at(&self) -> Option<DateTime<Utc>> {
        match self.inner.store.get(LAST_SYNCED_KEY).await {
            Ok(Some(raw)) => match DateTime::parse_from_rfc3339(raw.trim()) {
                Ok(at) => Some(at.with_timezone(&Utc)),
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable last-synced timestamp");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %SyncError::Persistence(e.to_string()), "Failed to load last-synced timestamp");
                None
            }
        }
    }

    async fn persist_queue(&self) {
        let _guard = self.inner.persist_lock.lock().await;
        let json = {
            let state = self.inner.state.lock();
            serde_json::to_string(&state.queue)
        };
        let result = match json {
            Ok(json) => self.inner.store.set(QUEUE_KEY, &json).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(error = %SyncError::Persistence(e.to_string()), "Failed to persist write queue");
        }
    }

    async fn persist_last_synced_at(&self) {
        let _guard = self.inner.persist_lock.lock().await;
        let Some(at) = self.inner.state.lock().last_synced_at else {
            return;
        };
        if let Err(e) = self.inner.store.set(LAST_SYNCED_KEY, &at.to_rfc3339()).await {
            warn!(error = %SyncError::Persistence(e.to_string()), "Failed to persist last-synced timestamp");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, HttpMethod};
    use crate::auth::StaticSession;
    use crate::clock::SystemClock;
    use crate::storage::MemoryStore;
    use crate::sync::MAX_RETRIES;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Debug, Clone)]
    struct Call {
        path: String,
        method: HttpMethod,
        body: Option<Value>,
        at: Instant,
    }

    type Responder = Box<dyn Fn(&str) -> Result<Value, ApiError> + Send + Sync>;

    /// Records every request. Sleeps for `delay_ms` when the body carries one.
    struct FakeRemote {
        calls: Mutex<Vec<Call>>,
        responder: Mutex<Responder>,
    }

    impl FakeRemote {
        fn accepting() -> Arc<Self> {
            Self::responding(|_| Ok(json!({"ok": true})))
        }

        fn responding(f: impl Fn(&str) -> Result<Value, ApiError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                responder: Mutex::new(Box::new(f)),
            })
        }

        fn respond_with(&self, f: impl Fn(&str) -> Result<Value, ApiError> + Send + Sync + 'static) {
            *self.responder.lock() = Box::new(f);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl RemoteApi for FakeRemote {
        async fn request(
            &self,
            path: &str,
            method: HttpMethod,
            body: Option<Value>,
        ) -> Result<Value, ApiError> {
            let delay = body
                .as_ref()
                .and_then(|b| b.get("delay_ms"))
                .and_then(Value::as_u64);
            self.calls.lock().push(Call {
                path: path.to_string(),
                method,
                body,
                at: Instant::now(),
            });
            if let Some(ms) = delay {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            let result = (*self.responder.lock())(path);
            result
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            Err(anyhow::anyhow!("disk unavailable"))
        }

        async fn set(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("disk unavailable"))
        }

        async fn remove(&self, _key: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("disk unavailable"))
        }
    }

    struct Harness {
        engine: SyncEngine,
        remote: Arc<FakeRemote>,
        network: watch::Sender<bool>,
        lifecycle: watch::Sender<AppLifecycle>,
    }

    fn harness(
        remote: Arc<FakeRemote>,
        store: Arc<dyn KeyValueStore>,
        online: bool,
        token: Option<&str>,
    ) -> Harness {
        let (network, network_rx) = watch::channel(online);
        let (lifecycle, lifecycle_rx) = watch::channel(AppLifecycle::Active);
        let engine = SyncEngine::new(SyncDeps {
            store,
            remote: remote.clone(),
            auth: Arc::new(StaticSession(token.map(str::to_string))),
            clock: Arc::new(SystemClock),
            network: network_rx,
            lifecycle: lifecycle_rx,
        });
        Harness {
            engine,
            remote,
            network,
            lifecycle,
        }
    }

    async fn signed_in(remote: Arc<FakeRemote>, online: bool) -> Harness {
        let h = harness(remote, Arc::new(MemoryStore::new()), online, Some("token"));
        h.engine.initialize().await;
        h
    }

    /// Signed in, but with no signal watchers running.
    async fn unwatched(remote: Arc<FakeRemote>, online: bool) -> Harness {
        let h = harness(remote, Arc::new(MemoryStore::new()), online, Some("token"));
        h.engine.set_authenticated(true);
        settle().await;
        h
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_reach_transport_in_enqueue_order() {
        let h = signed_in(FakeRemote::accepting(), false).await;

        h.engine
            .sync_to_cloud("/api/user/chat", WriteMethod::Post, json!({"n": 1, "delay_ms": 300}))
            .await;
        h.engine
            .sync_to_cloud("/api/user/chat", WriteMethod::Post, json!({"n": 2, "delay_ms": 10}))
            .await;
        h.engine
            .sync_to_cloud("/api/user/chat", WriteMethod::Post, json!({"n": 3, "delay_ms": 100}))
            .await;
        assert_eq!(h.engine.pending_count(), 3);

        h.network.send(true).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let order: Vec<u64> = h
            .remote
            .calls()
            .iter()
            .map(|c| c.body.as_ref().unwrap()["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(h.engine.pending_count(), 0);
        assert!(h.engine.status().last_synced_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_write_is_retried_with_backoff_then_dropped() {
        let remote = FakeRemote::responding(|_| Err(ApiError::ServerError("boom".into())));
        let h = signed_in(remote, true).await;

        let flush = h
            .engine
            .sync_to_cloud("/api/user/preferences", WriteMethod::Put, json!({"theme": "dark"}))
            .await
            .expect("online flush");
        let first = flush.await.unwrap();
        assert_eq!(
            first.report().and_then(|r| r.next_retry_in),
            Some(Duration::from_secs(2))
        );

        tokio::time::sleep(Duration::from_secs(120)).await;

        let calls = h.remote.calls();
        assert_eq!(calls.len(), MAX_RETRIES as usize);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].at - w[0].at).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16)
            ]
        );
        assert_eq!(h.engine.pending_count(), 0);
        assert!(h.engine.status().last_synced_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_count_survives_in_queue() {
        let remote = FakeRemote::responding(|_| Err(ApiError::ServerError("boom".into())));
        let h = signed_in(remote, true).await;

        h.engine
            .sync_to_cloud("/api/user/chat", WriteMethod::Post, json!({}))
            .await
            .expect("flush")
            .await
            .unwrap();
        let pending = h.engine.pending_writes();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 1);

        // Recovery on the scheduled retry
        h.remote.respond_with(|_| Ok(Value::Null));
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(h.engine.pending_count(), 0);
        assert_eq!(h.remote.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthenticated_writes_are_not_queued() {
        let h = harness(FakeRemote::accepting(), Arc::new(MemoryStore::new()), true, None);
        h.engine.initialize().await;

        let flush = h
            .engine
            .sync_to_cloud("/api/user/preferences", WriteMethod::Put, json!({}))
            .await;
        assert!(flush.is_none());
        assert_eq!(h.engine.status().pending_count, 0);
        assert!(!h.engine.status().is_authenticated);

        settle().await;
        assert!(h.remote.calls().is_empty());
        assert_eq!(
            h.engine.flush_queue().await,
            FlushOutcome::Skipped(SkipReason::Unauthenticated)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_drains_queue() {
        let h = signed_in(FakeRemote::accepting(), false).await;
        h.engine
            .sync_to_cloud("/api/user/preferences", WriteMethod::Put, json!({"a": 1}))
            .await;
        h.engine
            .sync_to_cloud("/api/user/coach-progress/basics", WriteMethod::Post, json!({"step": 2}))
            .await;
        assert_eq!(h.engine.status().pending_count, 2);
        assert!(!h.engine.status().is_online);

        h.network.send(true).unwrap();
        settle().await;

        let status = h.engine.status();
        assert_eq!(status.pending_count, 0);
        assert!(status.is_online);
        let paths: Vec<String> = h.remote.calls().into_iter().map(|c| c.path).collect();
        assert_eq!(
            paths,
            vec!["/api/user/preferences", "/api/user/coach-progress/basics"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_keeps_retry_budget() {
        let remote = FakeRemote::responding(|_| Err(ApiError::Unreachable("connection refused".into())));
        let h = signed_in(remote, true).await;

        let flush = h
            .engine
            .sync_to_cloud("/api/user/chat", WriteMethod::Post, json!({"text": "hi", "delay_ms": 100}))
            .await
            .expect("flush");
        // The device drops off the network while the request is out
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.network.send(false).unwrap();

        let outcome = flush.await.unwrap();
        let report = outcome.report().cloned().unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.next_retry_in, None);
        assert_eq!(h.engine.pending_writes()[0].retry_count, 0);

        // No timer: nothing happens until the network comes back
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.remote.calls().len(), 1);

        h.remote.respond_with(|_| Ok(Value::Null));
        h.network.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_error_while_online_is_retried() {
        let remote = FakeRemote::responding(|_| Err(ApiError::Unreachable("connection refused".into())));
        let h = signed_in(remote, true).await;

        let outcome = h
            .engine
            .sync_to_cloud("/api/user/chat", WriteMethod::Post, json!({"text": "hi"}))
            .await
            .expect("flush")
            .await
            .unwrap();
        let report = outcome.report().cloned().unwrap();
        assert_eq!(report.deferred, 0);
        assert_eq!(report.retrying, 1);
        assert_eq!(report.next_retry_in, Some(Duration::from_secs(2)));
        assert_eq!(h.engine.pending_writes()[0].retry_count, 1);

        // The backoff timer drives the next attempt without any network event
        h.remote.respond_with(|_| Ok(Value::Null));
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(h.remote.calls().len(), 2);
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_flushes_pending_writes() {
        let remote = FakeRemote::responding(|_| Err(ApiError::Unreachable("offline".into())));
        let h = signed_in(remote, true).await;
        h.engine
            .sync_to_cloud("/api/user/chat", WriteMethod::Post, json!({}))
            .await
            .expect("flush")
            .await
            .unwrap();
        assert_eq!(h.engine.pending_count(), 1);

        h.remote.respond_with(|_| Ok(Value::Null));
        h.lifecycle.send(AppLifecycle::Background).unwrap();
        settle().await;
        assert_eq!(h.engine.pending_count(), 1);

        h.lifecycle.send(AppLifecycle::Active).unwrap();
        settle().await;
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_endpoint_is_dropped() {
        let h = unwatched(FakeRemote::accepting(), false).await;
        h.engine
            .sync_to_cloud("/api/portfolio/optimize", WriteMethod::Post, json!({}))
            .await;
        h.engine
            .sync_to_cloud("/api/user/preferences", WriteMethod::Put, json!({}))
            .await;

        h.network.send_replace(true);
        let outcome = h.engine.flush_queue().await;
        let report = outcome.report().cloned().unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.next_retry_in, None);
        assert_eq!(h.engine.pending_count(), 0);
        assert_eq!(h.remote.calls().len(), 1);
        assert_eq!(h.remote.calls()[0].method, HttpMethod::Put);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_skip_reasons() {
        let h = unwatched(FakeRemote::accepting(), false).await;
        assert_eq!(
            h.engine.flush_queue().await,
            FlushOutcome::Skipped(SkipReason::Offline)
        );
        h.network.send_replace(true);
        assert_eq!(
            h.engine.flush_queue().await,
            FlushOutcome::Skipped(SkipReason::EmptyQueue)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_pass_at_a_time() {
        let h = signed_in(FakeRemote::accepting(), true).await;
        let first = h
            .engine
            .sync_to_cloud("/api/user/chat", WriteMethod::Post, json!({"n": 1, "delay_ms": 1000}))
            .await
            .expect("flush");
        settle().await;
        assert!(h.engine.status().is_syncing);

        // Enqueued mid-pass: its own flush is skipped, a follow-up pass sends it
        let second = h
            .engine
            .sync_to_cloud("/api/user/chat", WriteMethod::Post, json!({"n": 2}))
            .await
            .expect("flush");
        assert_eq!(
            second.await.unwrap(),
            FlushOutcome::Skipped(SkipReason::AlreadyFlushing)
        );

        let report = first.await.unwrap().report().cloned().unwrap();
        assert_eq!(report.attempted, 1);
        settle().await;

        assert_eq!(h.engine.pending_count(), 0);
        assert!(!h.engine.status().is_syncing);
        let order: Vec<u64> = h
            .remote
            .calls()
            .iter()
            .map(|c| c.body.as_ref().unwrap()["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_survives_restart() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

        let first = harness(FakeRemote::accepting(), store.clone(), false, Some("token"));
        first.engine.initialize().await;
        first
            .engine
            .sync_to_cloud("/api/user/preferences", WriteMethod::Put, json!({"a": 1}))
            .await;
        first
            .engine
            .sync_to_cloud("/api/user/chat", WriteMethod::Post, json!({"b": 2}))
            .await;
        let before = first.engine.pending_writes();
        first.engine.destroy();

        let second = harness(FakeRemote::accepting(), store.clone(), false, Some("token"));
        second.engine.initialize().await;
        assert_eq!(second.engine.pending_writes(), before);

        second.network.send(true).unwrap();
        settle().await;
        assert_eq!(second.engine.pending_count(), 0);

        let saved = store.get(QUEUE_KEY).await.unwrap().unwrap();
        assert_eq!(saved, "[]");
        let synced = store.get(LAST_SYNCED_KEY).await.unwrap().unwrap();
        assert!(DateTime::parse_from_rfc3339(&synced).is_ok());

        let third = harness(FakeRemote::accepting(), store, false, Some("token"));
        third.engine.initialize().await;
        assert!(third.engine.status().last_synced_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failures_are_swallowed() {
        let h = harness(FakeRemote::accepting(), Arc::new(BrokenStore), true, Some("token"));
        assert!(h.engine.initialize().await.is_none());

        let outcome = h
            .engine
            .sync_to_cloud("/api/user/preferences", WriteMethod::Put, json!({}))
            .await
            .expect("flush")
            .await
            .unwrap();
        assert_eq!(outcome.report().map(|r| r.completed), Some(1));
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_queue_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set(QUEUE_KEY, "{not json").await.unwrap();
        let h = harness(FakeRemote::accepting(), store, true, Some("token"));
        assert!(h.engine.initialize().await.is_none());
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_flushes_persisted_queue() {
        let store = Arc::new(MemoryStore::new());
        let queued = vec![QueuedWrite::new(
            "/api/user/chat",
            WriteMethod::Post,
            json!({"text": "saved offline"}),
            Utc::now(),
        )];
        store
            .set(QUEUE_KEY, &serde_json::to_string(&queued).unwrap())
            .await
            .unwrap();

        let h = harness(FakeRemote::accepting(), store, true, None);
        assert!(h.engine.initialize().await.is_none());
        assert_eq!(h.engine.pending_count(), 1);
        settle().await;
        assert!(h.remote.calls().is_empty());

        let outcome = h.engine.set_authenticated(true).expect("flush").await.unwrap();
        assert_eq!(outcome.report().map(|r| r.completed), Some(1));
        assert_eq!(h.engine.pending_count(), 0);
        assert!(h.engine.set_authenticated(true).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_flushes_when_ready() {
        let store = Arc::new(MemoryStore::new());
        let queued = vec![QueuedWrite::new(
            "/api/user/preferences",
            WriteMethod::Put,
            json!({}),
            Utc::now(),
        )];
        store
            .set(QUEUE_KEY, &serde_json::to_string(&queued).unwrap())
            .await
            .unwrap();

        let h = harness(FakeRemote::accepting(), store, true, Some("token"));
        let flush = h.engine.initialize().await.expect("initial flush");
        assert!(matches!(flush.await.unwrap(), FlushOutcome::Completed(_)));
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_see_current_and_later_status() {
        let h = signed_in(FakeRemote::accepting(), false).await;
        let mut rx = h.engine.subscribe();
        assert_eq!(rx.borrow_and_update().pending_count, 0);
        assert!(rx.borrow().is_authenticated);

        h.engine
            .sync_to_cloud("/api/user/chat", WriteMethod::Post, json!({}))
            .await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().pending_count, 1);

        h.network.send(true).unwrap();
        settle().await;
        assert!(rx.has_changed().unwrap());
        let status = rx.borrow_and_update().clone();
        assert_eq!(status.pending_count, 0);
        assert!(status.is_online);
        assert!(!status.is_syncing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_timers_and_watchers() {
        let remote = FakeRemote::responding(|_| Err(ApiError::ServerError("boom".into())));
        let h = signed_in(remote, true).await;
        h.engine
            .sync_to_cloud("/api/user/chat", WriteMethod::Post, json!({}))
            .await
            .expect("flush")
            .await
            .unwrap();
        assert_eq!(h.remote.calls().len(), 1);

        h.engine.destroy();
        h.engine.destroy();

        tokio::time::sleep(Duration::from_secs(60)).await;
        h.network.send(false).unwrap();
        h.network.send(true).unwrap();
        h.lifecycle.send(AppLifecycle::Background).unwrap();
        h.lifecycle.send(AppLifecycle::Active).unwrap();
        settle().await;

        assert_eq!(h.remote.calls().len(), 1);
        assert_eq!(h.engine.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_is_queued_whole_or_not_at_all() {
        let h = unwatched(FakeRemote::accepting(), false).await;
        let batch = || {
            (1..=3)
                .map(|n| WriteRequest::new("/api/user/chat", WriteMethod::Post, json!({"n": n})))
                .collect::<Vec<_>>()
        };

        assert!(h.engine.sync_all_to_cloud(batch()).await);
        assert_eq!(h.engine.pending_count(), 3);

        h.engine.set_authenticated(false);
        assert!(!h.engine.sync_all_to_cloud(batch()).await);
        assert_eq!(h.engine.pending_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_sign_in_survives_initialize() {
        let h = harness(FakeRemote::accepting(), Arc::new(MemoryStore::new()), false, None);
        h.engine.set_authenticated(true);
        h.engine.initialize().await;
        assert!(h.engine.status().is_authenticated);

        h.engine
            .sync_to_cloud("/api/user/preferences", WriteMethod::Put, json!({}))
            .await;
        assert_eq!(h.engine.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_all_tolerates_partial_failure() {
        let remote = FakeRemote::responding(|path| match path {
            "/api/user/preferences" => Ok(json!({"theme": "dark"})),
            "/api/user/coach-progress" => Ok(json!({"basics": {"step": 3}})),
            _ => Err(ApiError::ServerError("chat store down".into())),
        });
        let h = signed_in(remote, true).await;

        let snapshot = h.engine.fetch_all_user_data().await;
        assert_eq!(snapshot.preferences, Some(json!({"theme": "dark"})));
        assert_eq!(snapshot.coach_progress, Some(json!({"basics": {"step": 3}})));
        assert_eq!(snapshot.chat_history, None);
        assert!(h.remote.calls().iter().all(|c| c.method == HttpMethod::Get));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_all_skipped_when_signed_out() {
        let h = harness(FakeRemote::accepting(), Arc::new(MemoryStore::new()), true, None);
        h.engine.initialize().await;
        assert!(h.engine.fetch_all_user_data().await.is_empty());
        assert!(h.remote.calls().is_empty());
    }
}
