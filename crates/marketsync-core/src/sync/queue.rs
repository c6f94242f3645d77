use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::HttpMethod;

/// A queued write is attempted at most this many times.
pub const MAX_RETRIES: u32 = 5;

/// Backoff before the next flush pass, indexed by the highest retry count
/// among the entries that just failed.
pub const BACKOFF_SCHEDULE_MS: [u64; 5] = [2_000, 4_000, 8_000, 16_000, 32_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WriteMethod {
    Post,
    Put,
    Delete,
}

impl From<WriteMethod> for HttpMethod {
    fn from(method: WriteMethod) -> Self {
        match method {
            WriteMethod::Post => HttpMethod::Post,
            WriteMethod::Put => HttpMethod::Put,
            WriteMethod::Delete => HttpMethod::Delete,
        }
    }
}

/// One optimistic mutation waiting to be mirrored to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedWrite {
    pub id: String,
    pub endpoint: String,
    pub method: WriteMethod,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl QueuedWrite {
    pub fn new(
        endpoint: impl Into<String>,
        method: WriteMethod,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_write_id(now),
            endpoint: endpoint.into(),
            method,
            payload,
            enqueued_at: now,
            retry_count: 0,
        }
    }

    /// Count one more failed attempt. Returns `false` once the write has
    /// used up all [`MAX_RETRIES`] attempts and should be dropped.
    pub fn record_failure(&mut self) -> bool {
        self.retry_count += 1;
        self.retry_count < MAX_RETRIES
    }
}

/// A write as handed to the engine, before it gets an id.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub endpoint: String,
    pub method: WriteMethod,
    pub payload: Value,
}

impl WriteRequest {
    pub fn new(endpoint: impl Into<String>, method: WriteMethod, payload: Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            payload,
        }
    }
}

/// `<epoch millis>-<random base36>`; sortable by creation time.
fn new_write_id(now: DateTime<Utc>) -> String {
    let mut suffix = rand::thread_rng().gen::<u64>();
    let mut encoded = String::new();
    for _ in 0..9 {
        let digit = (suffix % 36) as u32;
        encoded.push(std::char::from_digit(digit, 36).unwrap_or('0'));
        suffix /= 36;
    }
    format!("{}-{}", now.timestamp_millis(), encoded)
}

/// Delay before retrying after a pass whose worst failed entry has been
/// attempted `max_retry_count` times.
pub fn backoff_delay(max_retry_count: u32) -> Duration {
    let index = (max_retry_count.max(1) - 1) as usize;
    let ms = BACKOFF_SCHEDULE_MS[index.min(BACKOFF_SCHEDULE_MS.len() - 1)];
    Duration::from_millis(ms)
}
