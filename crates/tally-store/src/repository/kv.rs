//! # Key/Value Repository
//!
//! Stores small documents (usually JSON) under string keys.
//!
//! ## Write-Through Documents
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        kv_store Table                                   │
//! │                                                                         │
//! │  key                  | value                        | updated_at      │
//! │  ─────────────────────┼──────────────────────────────┼──────────────── │
//! │  offline_sync_queue   | [{"id":"…","operation":…}]   | 2026-…T10:00Z  │
//! │                                                                         │
//! │  set() is a single UPSERT statement: the previous document is          │
//! │  replaced atomically, so a crash leaves either the old or the new      │
//! │  document, never a partial one.                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::StoreResult;

/// Repository for key/value documents.
#[derive(Debug, Clone)]
pub struct KvRepository {
    pool: SqlitePool,
}

impl KvRepository {
    pub fn new(pool: SqlitePool) -> Self {
        KvRepository { pool }
    }

    /// Returns the document stored under `key`, if any.
    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM kv_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    /// Inserts or replaces the document stored under `key`.
    pub async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let now = Utc::now().to_rfc3339();

        debug!(key = %key, bytes = value.len(), "Writing document");

        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Removes the document. Returns true if it existed.
    pub async fn remove(&self, key: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM kv_store WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Lists all keys in lexical order.
    pub async fn keys(&self) -> StoreResult<Vec<String>> {
        let keys: Vec<String> = sqlx::query_scalar("SELECT key FROM kv_store ORDER BY key")
            .fetch_all(&self.pool)
            .await?;

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_set_get_overwrite_remove() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let kv = db.kv();

        assert_eq!(kv.get("missing").await.unwrap(), None);

        kv.set("queue", "[]").await.unwrap();
        assert_eq!(kv.get("queue").await.unwrap().as_deref(), Some("[]"));

        kv.set("queue", "[1]").await.unwrap();
        assert_eq!(kv.get("queue").await.unwrap().as_deref(), Some("[1]"));
        assert_eq!(kv.keys().await.unwrap(), vec!["queue".to_string()]);

        assert!(kv.remove("queue").await.unwrap());
        assert!(!kv.remove("queue").await.unwrap());
        assert_eq!(kv.get("queue").await.unwrap(), None);
    }
}
