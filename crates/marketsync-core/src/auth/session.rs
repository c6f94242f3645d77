use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::AuthProvider;

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

/// Token expiry time in minutes.
const TOKEN_EXPIRY_MINUTES: i64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub token: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

impl SessionData {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        let expiry = self.created_at + Duration::minutes(TOKEN_EXPIRY_MINUTES);
        Utc::now() > expiry
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        let expiry = self.created_at + Duration::minutes(TOKEN_EXPIRY_MINUTES);
        (expiry - Utc::now()).num_minutes().max(0)
    }
}

/// Session persisted next to the rest of the app's local data.
pub struct SessionStore {
    data_dir: PathBuf,
    data: Mutex<Option<SessionData>>,
}

impl SessionStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            data: Mutex::new(None),
        }
    }

    /// Load session from disk. Returns whether a live session was found.
    pub fn load(&self) -> Result<bool> {
        let path = self.session_path();
        if path.exists() {
            let contents =
                std::fs::read_to_string(&path).context("Failed to read session file")?;
            let data: SessionData =
                serde_json::from_str(&contents).context("Failed to parse session file")?;

            if !data.is_expired() {
                *self.data.lock() = Some(data);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Save session to disk
    pub fn save(&self) -> Result<()> {
        let data = self.data.lock().clone();
        if let Some(data) = data {
            let path = self.session_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let contents = serde_json::to_string_pretty(&data)?;
            std::fs::write(path, contents)?;
        }
        Ok(())
    }

    /// Clear session data
    pub fn clear(&self) -> Result<()> {
        *self.data.lock() = None;
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Replace the in-memory session; call `save` to keep it.
    pub fn update(&self, data: SessionData) {
        *self.data.lock() = Some(data);
    }

    pub fn data(&self) -> Option<SessionData> {
        self.data.lock().clone()
    }

    fn session_path(&self) -> PathBuf {
        self.data_dir.join(SESSION_FILE)
    }
}

#[async_trait]
impl AuthProvider for SessionStore {
    async fn current_session(&self) -> Option<String> {
        self.data
            .lock()
            .as_ref()
            .filter(|d| !d.is_expired())
            .map(|d| d.token.clone())
    }
}
