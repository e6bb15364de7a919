//! Custom schema migrator, §4.K.
//!
//! Migrations are embedded at compile time from
//! `migrations/sqlite/<version>_<name>/{up.sql,down.sql}`. A ledger table
//! records which versions have been applied; each migration runs inside its
//! own atomic scope so a failing step leaves the schema exactly where it
//! started.

use rusqlite::Connection;

use crate::error::{RepositoryError, Result};
use crate::storage::pool::DbPool;

pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

/// The registered migrations, sorted by version. `include_str!` binds the
/// SQL at compile time, matching the §4.K "embedded at compile time" rule.
pub fn registered_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "initial schema",
            up: include_str!("../../migrations/sqlite/001_initial_schema/up.sql"),
            down: include_str!("../../migrations/sqlite/001_initial_schema/down.sql"),
        },
        Migration {
            version: 2,
            description: "FTS5 content index",
            up: include_str!("../../migrations/sqlite/002_fts_content_index/up.sql"),
            down: include_str!("../../migrations/sqlite/002_fts_content_index/down.sql"),
        },
    ]
}

fn ensure_ledger(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER NOT NULL,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
         );
         CREATE UNIQUE INDEX IF NOT EXISTS idx_schema_migrations_version
            ON schema_migrations(version);",
    )
    .map_err(RepositoryError::from)
}

fn current_version(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(RepositoryError::from)
}

/// Apply every migration with `version > current` inside its own atomic
/// scope. Stops at the first failure; already-applied migrations remain
/// committed.
pub async fn migrate(pool: &DbPool) -> Result<Vec<i64>> {
    let mut applied = Vec::new();
    pool.with_conn(|conn| ensure_ledger(conn)).await?;

    let migrations = registered_migrations();
    let current = pool.with_conn(|conn| current_version(conn)).await?;

    for migration in migrations.into_iter().filter(|m| m.version > current) {
        let version = migration.version;
        let description = migration.description.to_string();
        let up_sql = migration.up.to_string();
        pool.atomic(move |tx| {
            tx.execute_batch(&up_sql).map_err(RepositoryError::from)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![version, description, chrono::Utc::now().to_rfc3339()],
            )
            .map_err(RepositoryError::from)?;
            Ok(())
        })
        .await?;
        tracing::info!(version, "applied migration");
        applied.push(version);
    }

    Ok(applied)
}

/// Roll back exactly one version: the `down` of the current highest applied
/// migration.
pub async fn rollback_one(pool: &DbPool) -> Result<Option<i64>> {
    pool.with_conn(|conn| ensure_ledger(conn)).await?;
    let current = pool.with_conn(|conn| current_version(conn)).await?;
    if current == 0 {
        return Ok(None);
    }

    let migrations = registered_migrations();
    let migration = migrations
        .into_iter()
        .find(|m| m.version == current)
        .ok_or_else(|| RepositoryError::not_found(format!("migration {current} is not registered")))?;

    let down_sql = migration.down.to_string();
    pool.atomic(move |tx| {
        tx.execute_batch(&down_sql).map_err(RepositoryError::from)?;
        tx.execute(
            "DELETE FROM schema_migrations WHERE version = ?1",
            rusqlite::params![current],
        )
        .map_err(RepositoryError::from)?;
        Ok(())
    })
    .await?;

    Ok(Some(current))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_applies_all_registered_versions() {
        let pool = DbPool::open_in_memory().unwrap();
        let applied = migrate(&pool).await.unwrap();
        assert_eq!(applied, vec![1, 2]);

        let again = migrate(&pool).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn rollback_removes_ledger_entry() {
        let pool = DbPool::open_in_memory().unwrap();
        migrate(&pool).await.unwrap();
        let rolled_back = rollback_one(&pool).await.unwrap();
        assert_eq!(rolled_back, Some(2));

        let current = pool.with_conn(|conn| current_version(conn)).await.unwrap();
        assert_eq!(current, 1);
    }
}
