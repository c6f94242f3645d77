//! One-shot migration of legacy local data into the write queue.
//!
//! Older app versions kept preferences, coach progress and chat history only
//! on the device. Once a user is signed in, [`Bootstrap::run`] replays each
//! category through the sync engine exactly once.
//!
//! Completion is tracked per category, and a category's writes are queued as
//! one unit, so a category is either fully queued and marked done or left
//! for the next run.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::WriteOperation;
use crate::storage::KeyValueStore;
use crate::sync::{SyncEngine, WriteMethod, WriteRequest};

/// Store key holding the persisted [`MigrationState`].
pub const MIGRATION_STATE_KEY: &str = "marketsync.migration_state";

pub const LEGACY_PREFERENCES_KEY: &str = "legacy.preferences";
pub const LEGACY_COACH_PROGRESS_KEY: &str = "legacy.coach_progress";
pub const LEGACY_CHAT_HISTORY_KEY: &str = "legacy.chat_history";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationCategory {
    Preferences,
    CoachProgress,
    ChatHistory,
}

impl MigrationCategory {
    pub const ALL: [MigrationCategory; 3] = [
        MigrationCategory::Preferences,
        MigrationCategory::CoachProgress,
        MigrationCategory::ChatHistory,
    ];

    pub fn legacy_key(self) -> &'static str {
        match self {
            MigrationCategory::Preferences => LEGACY_PREFERENCES_KEY,
            MigrationCategory::CoachProgress => LEGACY_COACH_PROGRESS_KEY,
            MigrationCategory::ChatHistory => LEGACY_CHAT_HISTORY_KEY,
        }
    }
}

/// Which categories are done, persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    #[serde(default)]
    pub completed: BTreeSet<MigrationCategory>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl MigrationState {
    pub fn is_done(&self, category: MigrationCategory) -> bool {
        self.completed.contains(&category)
    }

    pub fn is_complete(&self) -> bool {
        MigrationCategory::ALL.iter().all(|c| self.is_done(*c))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryOutcome {
    /// Done in an earlier run; nothing was sent.
    AlreadyDone,
    /// Queued now. Zero writes means there was no legacy data.
    Migrated { writes: usize },
    /// Legacy data exists but cannot be turned into writes. Marked done,
    /// since retrying can never succeed.
    Undecodable(String),
    /// Left for the next run.
    Pending(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub outcomes: Vec<(MigrationCategory, CategoryOutcome)>,
}

impl MigrationReport {
    pub fn outcome(&self, category: MigrationCategory) -> Option<&CategoryOutcome> {
        self.outcomes.iter().find(|(c, _)| *c == category).map(|(_, o)| o)
    }

    pub fn is_complete(&self) -> bool {
        !self
            .outcomes
            .iter()
            .any(|(_, o)| matches!(o, CategoryOutcome::Pending(_)))
    }

    pub fn migrated_writes(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, o)| match o {
                CategoryOutcome::Migrated { writes } => *writes,
                _ => 0,
            })
            .sum()
    }
}

/// Turn one category's legacy JSON into writes.
fn decode_category(category: MigrationCategory, raw: &str) -> Result<Vec<WriteRequest>, String> {
    let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    match (category, value) {
        (MigrationCategory::Preferences, Value::Object(map)) if map.is_empty() => Ok(Vec::new()),
        (MigrationCategory::Preferences, Value::Object(map)) => Ok(vec![WriteRequest::new(
            WriteOperation::Preferences.endpoint(),
            WriteMethod::Put,
            Value::Object(map),
        )]),
        (MigrationCategory::CoachProgress, Value::Object(map)) => Ok(map
            .into_iter()
            .map(|(path_id, progress)| {
                let endpoint = WriteOperation::CoachProgressByPath { path_id }.endpoint();
                WriteRequest::new(endpoint, WriteMethod::Put, progress)
            })
            .collect()),
        (MigrationCategory::ChatHistory, Value::Array(conversations)) => Ok(conversations
            .into_iter()
            .map(|c| WriteRequest::new(WriteOperation::ChatSave.endpoint(), WriteMethod::Post, c))
            .collect()),
        (MigrationCategory::ChatHistory, _) => Err("expected an array".to_string()),
        (_, _) => Err("expected an object".to_string()),
    }
}

/// Clears the in-progress flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Bootstrap {
    engine: SyncEngine,
    store: Arc<dyn KeyValueStore>,
    running: AtomicBool,
}

impl Bootstrap {
    pub fn new(engine: SyncEngine, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            engine,
            store,
            running: AtomicBool::new(false),
        }
    }

    pub async fn load_state(&self) -> Result<MigrationState> {
        let raw = self
            .store
            .get(MIGRATION_STATE_KEY)
            .await
            .context("Failed to read migration state")?;
        match raw {
            Some(raw) => serde_json::from_str(&raw).context("Failed to parse migration state"),
            None => Ok(MigrationState::default()),
        }
    }

    /// Migrate every category not yet done.
    ///
    /// Returns `Ok(None)` without doing anything when signed out or when
    /// another run is in progress. Fails only if the migration state itself
    /// cannot be read, since migrating without it could send data twice.
    pub async fn run(&self) -> Result<Option<MigrationReport>> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Migration already running");
            return Ok(None);
        }
        let _guard = RunGuard(&self.running);

        if !self.engine.status().is_authenticated {
            debug!("Not authenticated, deferring migration");
            return Ok(None);
        }

        let mut state = self.load_state().await?;
        let (done, pending): (Vec<_>, Vec<_>) =
            MigrationCategory::ALL.into_iter().partition(|c| state.is_done(*c));
        let mut report = MigrationReport {
            outcomes: done.into_iter().map(|c| (c, CategoryOutcome::AlreadyDone)).collect(),
        };
        if pending.is_empty() {
            return Ok(Some(report));
        }

        let keys: Vec<&str> = pending.iter().map(|c| c.legacy_key()).collect();
        let legacy: Vec<Result<Option<String>, String>> = match self.store.multi_get(&keys).await {
            Ok(values) => values.into_iter().map(|(_, raw)| Ok(raw)).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to read legacy data, will retry next launch");
                vec![Err(e.to_string()); pending.len()]
            }
        };

        for (category, raw) in pending.into_iter().zip(legacy) {
            let outcome = match raw {
                Ok(raw) => self.migrate_category(category, raw.as_deref()).await,
                Err(reason) => CategoryOutcome::Pending(reason),
            };
            if !matches!(outcome, CategoryOutcome::Pending(_)) {
                state.completed.insert(category);
                if state.is_complete() {
                    state.completed_at = Some(Utc::now());
                }
                if let Err(e) = self.save_state(&state).await {
                    warn!(?category, error = %e, "Failed to record migration progress");
                }
            }
            report.outcomes.push((category, outcome));
        }

        info!(
            writes = report.migrated_writes(),
            complete = report.is_complete(),
            "Legacy data migration finished"
        );
        Ok(Some(report))
    }

    async fn save_state(&self, state: &MigrationState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.store
            .set(MIGRATION_STATE_KEY, &json)
            .await
            .context("Failed to write migration state")
    }

    async fn migrate_category(&self, category: MigrationCategory, raw: Option<&str>) -> CategoryOutcome {
        let writes = match raw.map(|raw| decode_category(category, raw)) {
            None => Vec::new(),
            Some(Ok(writes)) => writes,
            Some(Err(reason)) => {
                warn!(?category, reason = %reason, "Skipping undecodable legacy data");
                return CategoryOutcome::Undecodable(reason);
            }
        };
        let count = writes.len();
        if count > 0 && !self.engine.sync_all_to_cloud(writes).await {
            return CategoryOutcome::Pending("signed out during migration".to_string());
        }
        debug!(?category, writes = count, "Migrated legacy category");
        CategoryOutcome::Migrated { writes: count }
    }
}
