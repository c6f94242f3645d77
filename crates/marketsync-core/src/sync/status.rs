use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the UI's "syncing…" indicator needs. Derived from engine state and
/// re-broadcast on every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending_count: usize,
    pub is_syncing: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub is_online: bool,
    pub is_authenticated: bool,
}

/// Foreground state reported by the host application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppLifecycle {
    #[default]
    Active,
    Inactive,
    Background,
}

impl AppLifecycle {
    pub fn is_active(self) -> bool {
        self == AppLifecycle::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyFlushing,
    Offline,
    Unauthenticated,
    EmptyQueue,
}

/// Result of one flush pass over a queue snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub attempted: usize,
    pub completed: usize,
    /// Failed but kept for a later pass.
    pub retrying: usize,
    /// Removed without succeeding: retries exhausted or unknown endpoint.
    pub dropped: usize,
    /// Not attempted, or stopped by a lost connection; left untouched.
    pub deferred: usize,
    pub next_retry_in: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Skipped(SkipReason),
    Completed(FlushReport),
}

impl FlushOutcome {
    pub fn report(&self) -> Option<&FlushReport> {
        match self {
            FlushOutcome::Completed(report) => Some(report),
            FlushOutcome::Skipped(_) => None,
        }
    }
}
