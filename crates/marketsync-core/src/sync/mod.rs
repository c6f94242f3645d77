//! Outbound write queue.
//!
//! This module provides:
//! - `queue`: the persisted `QueuedWrite` record, retry limit and backoff schedule
//! - `status`: `SyncStatus`, lifecycle signal and flush outcomes
//! - `engine`: `SyncEngine`, which owns the queue and drives flushing

pub mod engine;
pub mod queue;
pub mod status;

pub use engine::{SyncDeps, SyncEngine, LAST_SYNCED_KEY, QUEUE_KEY};
pub use queue::{
    backoff_delay, QueuedWrite, WriteMethod, WriteRequest, BACKOFF_SCHEDULE_MS, MAX_RETRIES,
};
pub use status::{AppLifecycle, FlushOutcome, FlushReport, SkipReason, SyncStatus};
