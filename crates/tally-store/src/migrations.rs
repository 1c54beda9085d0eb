//! Embedded schema for the sync store.
//!
//! Files live in the workspace `migrations/sqlite/` directory and are compiled
//! into the binary. Append new `NNN_name.sql` files; shipped ones are frozen.

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::StoreResult;

static SCHEMA: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Applies whatever the database has not seen yet.
pub async fn run_migrations(pool: &SqlitePool) -> StoreResult<()> {
    SCHEMA.run(pool).await?;
    debug!(known = SCHEMA.migrations.len(), "Store schema up to date");
    Ok(())
}

/// Number of embedded migrations and how many of them the database records
/// as applied.
pub async fn migration_status(pool: &SqlitePool) -> StoreResult<(usize, usize)> {
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success")
        .fetch_one(pool)
        .await?;

    Ok((SCHEMA.migrations.len(), usize::try_from(applied).unwrap_or(0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_schema_applied_once() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (known, applied) = migration_status(db.pool()).await.unwrap();
        assert_eq!(known, applied);
        assert!(known >= 1);

        run_migrations(db.pool()).await.unwrap();
        assert_eq!(migration_status(db.pool()).await.unwrap(), (known, applied));
    }
}
