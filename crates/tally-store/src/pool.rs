//! # Connection Pool
//!
//! SQLite connection pool creation and configuration.
//!
//! ## Durability Settings
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    SQLite Pragmas                                       │
//! │                                                                         │
//! │  journal_mode = WAL      Readers don't block the single writer         │
//! │  synchronous  = FULL     A committed write survives power loss.        │
//! │                          The offline queue promises write-through      │
//! │                          durability, so NORMAL is not enough here.     │
//! │  busy_timeout = 5s       Wait for the writer lock instead of failing   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migrations;
use crate::repository::kv::KvRepository;
use crate::KeyValueStore;

const MEMORY_PATH: &str = ":memory:";

/// Where the store lives and how long callers wait on it.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_path: PathBuf,

    /// The queue writes one document at a time, so a handful is plenty.
    pub max_connections: u32,

    /// Upper bound on waiting for a free connection.
    pub acquire_timeout: Duration,

    /// Upper bound on waiting for the SQLite write lock.
    pub busy_timeout: Duration,
}

impl DbConfig {
    /// File-backed store. Parent directories are created on open.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Private in-memory store. Pinned to one connection, otherwise each
    /// connection would see its own empty database.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(MEMORY_PATH),
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(1),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path == Path::new(MEMORY_PATH)
    }

    fn connect_options(&self) -> SqliteConnectOptions {
        let options = if self.is_in_memory() {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            SqliteConnectOptions::new()
                .filename(&self.database_path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };

        options
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(self.busy_timeout)
    }
}

/// SQLite-backed [`KeyValueStore`]. Clones share one pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (or creates) the store and brings its schema up to date.
    pub async fn new(config: DbConfig) -> StoreResult<Self> {
        if !config.is_in_memory() {
            if let Some(parent) = config.database_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::ConnectionFailed(format!(
                            "cannot create {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
            }
        }

        debug!(
            path = %config.database_path.display(),
            max_connections = config.max_connections,
            "Opening sync store"
        );

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout);
        if config.is_in_memory() {
            // Recycling the only connection would wipe the database.
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(config.connect_options())
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        migrations::run_migrations(&pool).await?;

        info!(path = %config.database_path.display(), "Sync store ready");
        Ok(Database { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn kv(&self) -> KvRepository {
        KvRepository::new(self.pool.clone())
    }

    /// Closes the pool. Later reads and writes fail with `ConnectionFailed`.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

#[async_trait]
impl KeyValueStore for Database {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.kv().get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.kv().set(key, value).await
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        self.kv().remove(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.health_check().await);
    }

    #[test]
    fn test_in_memory_detection() {
        assert!(DbConfig::in_memory().is_in_memory());
        assert!(!DbConfig::new("/tmp/tally.db").is_in_memory());
        assert_eq!(DbConfig::in_memory().max_connections, 1);
    }

    #[tokio::test]
    async fn test_file_store_creates_parent_dirs_and_persists() {
        let dir = std::env::temp_dir().join(format!("tally-pool-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("nested").join("tally.db");

        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        db.set("k", "v").await.unwrap();
        db.close().await;

        let reopened = Database::new(DbConfig::new(&path)).await.unwrap();
        assert_eq!(reopened.get("k").await.unwrap().as_deref(), Some("v"));
        reopened.close().await;

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_closed_pool_fails_health_check() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.close().await;
        assert!(!db.health_check().await);
    }
}
