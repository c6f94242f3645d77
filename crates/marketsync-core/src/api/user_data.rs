//! Typed façade over the user-data endpoints.
//!
//! The write queue persists plain endpoint strings; [`WriteOperation`] turns
//! them back into the small closed set of writes the backend understands.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::remote::{HttpMethod, RemoteApi};
use super::ApiError;
use crate::error::SyncError;
use crate::sync::WriteMethod;

pub const PREFERENCES_PATH: &str = "/api/user/preferences";
pub const COACH_PROGRESS_PATH: &str = "/api/user/coach-progress";
pub const CHAT_PATH: &str = "/api/user/chat";

/// Known write operations, recovered from a queued endpoint string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOperation {
    Preferences,
    CoachProgress,
    CoachProgressByPath { path_id: String },
    ChatSave,
    Unknown(String),
}

impl WriteOperation {
    pub fn parse(endpoint: &str) -> Self {
        let path = endpoint
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/');

        if path == PREFERENCES_PATH {
            return WriteOperation::Preferences;
        }
        if path == COACH_PROGRESS_PATH {
            return WriteOperation::CoachProgress;
        }
        if path == CHAT_PATH {
            return WriteOperation::ChatSave;
        }
        if let Some(rest) = path.strip_prefix(COACH_PROGRESS_PATH) {
            if let Some(path_id) = rest.strip_prefix('/') {
                if !path_id.is_empty() && !path_id.contains('/') {
                    return WriteOperation::CoachProgressByPath {
                        path_id: path_id.to_string(),
                    };
                }
            }
        }
        WriteOperation::Unknown(endpoint.to_string())
    }

    /// The endpoint string callers enqueue for this operation.
    pub fn endpoint(&self) -> String {
        match self {
            WriteOperation::Preferences => PREFERENCES_PATH.to_string(),
            WriteOperation::CoachProgress => COACH_PROGRESS_PATH.to_string(),
            WriteOperation::CoachProgressByPath { path_id } => {
                format!("{}/{}", COACH_PROGRESS_PATH, path_id)
            }
            WriteOperation::ChatSave => CHAT_PATH.to_string(),
            WriteOperation::Unknown(endpoint) => endpoint.clone(),
        }
    }
}

/// Latest server-side truth for each user-data category.
/// A category is `None` when its fetch failed or was skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDataSnapshot {
    pub preferences: Option<Value>,
    pub coach_progress: Option<Value>,
    pub chat_history: Option<Value>,
}

impl UserDataSnapshot {
    pub fn is_empty(&self) -> bool {
        self.preferences.is_none() && self.coach_progress.is_none() && self.chat_history.is_none()
    }
}

#[derive(Clone)]
pub struct UserDataApi {
    remote: Arc<dyn RemoteApi>,
}

impl UserDataApi {
    pub fn new(remote: Arc<dyn RemoteApi>) -> Self {
        Self { remote }
    }

    // ===== Writes =====

    /// Send one queued write to the route its endpoint names. A query string
    /// on the endpoint travels with the request.
    pub async fn apply(&self, endpoint: &str, method: WriteMethod, payload: Value) -> Result<(), SyncError> {
        let operation = WriteOperation::parse(endpoint);
        if let WriteOperation::Unknown(endpoint) = operation {
            return Err(SyncError::UnknownOperation(endpoint));
        }
        let path = format!("{}{}", operation.endpoint(), query_of(endpoint));
        self.remote
            .request(&path, method.into(), Some(payload))
            .await
            .map(|_| ())
            .map_err(SyncError::from)
    }

    // ===== Reads =====

    pub async fn fetch_preferences(&self) -> Result<Value, ApiError> {
        self.remote.request(PREFERENCES_PATH, HttpMethod::Get, None).await
    }

    pub async fn fetch_coach_progress(&self) -> Result<Value, ApiError> {
        self.remote.request(COACH_PROGRESS_PATH, HttpMethod::Get, None).await
    }

    pub async fn fetch_chat_history(&self) -> Result<Value, ApiError> {
        self.remote.request(CHAT_PATH, HttpMethod::Get, None).await
    }

    /// Fetch every category in parallel; one failing category never blocks
    /// the others.
    pub async fn fetch_all(&self) -> UserDataSnapshot {
        let (preferences, coach_progress, chat_history) = tokio::join!(
            self.fetch_preferences(),
            self.fetch_coach_progress(),
            self.fetch_chat_history(),
        );

        UserDataSnapshot {
            preferences: settle("preferences", preferences),
            coach_progress: settle("coach_progress", coach_progress),
            chat_history: settle("chat_history", chat_history),
        }
    }
}

/// The `?query` part of an endpoint, without any fragment.
fn query_of(endpoint: &str) -> &str {
    let endpoint = endpoint.split('#').next().unwrap_or_default();
    endpoint.find('?').map_or("", |at| &endpoint[at..])
}

fn settle(category: &str, result: Result<Value, ApiError>) -> Option<Value> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(category = category, error = %e, "Failed to fetch user data category");
            None
        }
    }
}
