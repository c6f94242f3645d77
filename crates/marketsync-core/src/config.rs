//! Application configuration management.
//!
//! This module handles loading the configuration: backend URL,
//! cache TTLs, polling cadence and market-session window.
//!
//! Configuration is stored at `~/.config/marketsync/config.json`; local data
//! (write queue, session, migration state) lives under the platform data
//! directory.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::api::client::REQUEST_TIMEOUT_SECS;

/// Application name used for config/data directory paths
const APP_NAME: &str = "marketsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,

    /// TTL for live price data.
    pub live_ttl_secs: u64,
    /// TTL for list and feed data.
    pub feed_ttl_secs: u64,
    /// TTL for slow-changing reference data.
    pub reference_ttl_secs: u64,
    pub sweep_interval_secs: u64,

    pub quote_poll_interval_ms: u64,
    pub watched_symbols: Vec<String>,

    /// How often `run` checks that the backend is reachable.
    pub reachability_check_secs: u64,

    /// Regular session window in minutes after 00:00 UTC.
    pub market_open_minute_utc: u32,
    pub market_close_minute_utc: u32,

    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.marketsync.app".to_string(),
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            live_ttl_secs: 15,
            feed_ttl_secs: 30,
            reference_ttl_secs: 300,
            sweep_interval_secs: 60,
            quote_poll_interval_ms: 15_000,
            watched_symbols: Vec::new(),
            reachability_check_secs: 15,
            market_open_minute_utc: 14 * 60 + 30,
            market_close_minute_utc: 21 * 60,
            log_dir: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir =
            dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn quote_poll_interval(&self) -> Duration {
        Duration::from_millis(self.quote_poll_interval_ms)
    }

    pub fn reachability_check_interval(&self) -> Duration {
        Duration::from_secs(self.reachability_check_secs.max(1))
    }
}
