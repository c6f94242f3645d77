//! Error types shared across the sync engine and the read cache.

use std::sync::Arc;

use thiserror::Error;

use crate::api::ApiError;

/// Failures observed while flushing the write queue.
///
/// None of these reach the caller of `sync_to_cloud`; they decide what the
/// engine does with the queued entry.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The request never reached the backend. The entry stays queued and the
    /// next reconnect drives the retry.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// 429/503 that outlived the transport's own retries.
    #[error("backend overloaded")]
    ServerOverload,

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("write {id} dropped after {attempts} attempts")]
    MaxRetriesExceeded { id: String, attempts: u32 },

    #[error("unknown write operation: {0}")]
    UnknownOperation(String),

    #[error("persistence unavailable: {0}")]
    Persistence(String),
}

impl SyncError {
    /// Entries failing this way keep their retry budget.
    pub fn is_network_unavailable(&self) -> bool {
        matches!(self, SyncError::NetworkUnavailable(_))
    }
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        if err.is_unreachable() {
            SyncError::NetworkUnavailable(err.to_string())
        } else if err.is_overload() {
            SyncError::ServerOverload
        } else {
            SyncError::WriteFailed(err.to_string())
        }
    }
}

/// Read-path failure, cloneable so every deduplicated caller gets a copy.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("fetch failed: {0}")]
    Failed(Arc<anyhow::Error>),

    #[error("fetch task aborted before completing")]
    Aborted,
}

impl FetchError {
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        FetchError::Failed(Arc::new(err.into()))
    }
}
