//! # tally-store: Durable Storage for Tally
//!
//! Key/value persistence behind the offline sync queue.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Data Flow                                  │
//! │                                                                         │
//! │  SyncQueue::enqueue / drain step                                       │
//! │       │  save_json(store, "offline_sync_queue", &items)                │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    tally-store (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │ KeyValueStore │    │   Database    │    │ MemoryStore  │  │   │
//! │  │   │    (trait)    │◄───│  (SQLite)     │    │  (tests)     │  │   │
//! │  │   └───────────────┘    └───────┬───────┘    └──────────────┘  │   │
//! │  │                                │                               │   │
//! │  │                        ┌───────▼───────┐                       │   │
//! │  │                        │ KvRepository  │  001_kv_store.sql     │   │
//! │  │                        └───────────────┘                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_store::{load_json, save_json, Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("tally.db")).await?;
//! save_json(&db, "offline_sync_queue", &items).await?;
//! let restored: Option<Vec<Item>> = load_json(&db, "offline_sync_queue").await?;
//! ```

pub mod error;
pub mod memory;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use pool::{Database, DbConfig};
pub use repository::kv::KvRepository;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

// =============================================================================
// Store Abstraction
// =============================================================================

/// Durable key/value storage.
///
/// `set` must not return until the value is durable: callers rely on it for
/// write-through semantics.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Returns true if the key existed.
    async fn remove(&self, key: &str) -> StoreResult<bool>;
}

/// Reads and decodes a JSON document.
pub async fn load_json<T>(store: &dyn KeyValueStore, key: &str) -> StoreResult<Option<T>>
where
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::serialization(key, e)),
        None => Ok(None),
    }
}

/// Encodes and writes a JSON document.
pub async fn save_json<T>(store: &dyn KeyValueStore, key: &str, value: &T) -> StoreResult<()>
where
    T: Serialize + ?Sized + Sync,
{
    let raw = serde_json::to_string(value).map_err(|e| StoreError::serialization(key, e))?;
    store.set(key, &raw).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_json_helpers_roundtrip_through_sqlite() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        save_json(&db, "numbers", &vec![1, 2, 3]).await.unwrap();
        let restored: Option<Vec<i32>> = load_json(&db, "numbers").await.unwrap();
        assert_eq!(restored, Some(vec![1, 2, 3]));

        let missing: Option<Vec<i32>> = load_json(&db, "nothing").await.unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_load_json_reports_corrupt_document() {
        let store = MemoryStore::new();
        store.set("numbers", "{not json").await.unwrap();

        let err = load_json::<Vec<i32>>(&store, "numbers").await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization { ref key, .. } if key == "numbers"));
    }
}
