//! Durable key-value persistence.
//!
//! The sync engine and the migration glue own JSON encoding at this
//! boundary; a [`KeyValueStore`] only moves strings.
//!
//! Implementations:
//! - [`FileStore`]: one JSON document per key inside a directory
//! - [`MemoryStore`]: process-local map, used in tests and as a fallback when
//!   no data directory is available

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Read several keys at once, preserving the order of `keys`.
    async fn multi_get(&self, keys: &[&str]) -> Result<Vec<(String, Option<String>)>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push((key.to_string(), self.get(key).await?));
        }
        Ok(values)
    }
}
