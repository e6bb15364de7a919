//! Pooled SQLite connections.
//!
//! One `r2d2` pool per process, sized from `database.pool_size`. Every
//! repository method checks a connection out, runs its SQL on the tokio
//! blocking pool (SQLite access is synchronous), and returns it to `r2d2`
//! automatically via `Drop`.

use std::path::Path;
use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::error::{RepositoryError, Result};
use crate::storage::circuit_breaker::CircuitBreaker;

pub type Pool = r2d2::Pool<SqliteConnectionManager>;
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Shared database handle: a connection pool plus the breaker that guards it.
#[derive(Clone)]
pub struct DbPool {
    pool: Pool,
    breaker: std::sync::Arc<CircuitBreaker>,
}

impl DbPool {
    /// Open (or create) a SQLite database file with the pragmas the teacher
    /// crate applies for concurrent readers + one writer.
    pub fn open(path: &Path, pool_size: u32) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 30000;
                 PRAGMA cache_size = -64000;",
            )
        });
        let pool = r2d2::Pool::builder()
            .max_size(pool_size)
            .connection_timeout(Duration::from_secs(30))
            .build(manager)
            .map_err(|e| RepositoryError::connection(format!("failed to build pool: {e}")))?;
        Ok(Self {
            pool,
            breaker: std::sync::Arc::new(CircuitBreaker::default()),
        })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| RepositoryError::connection(format!("failed to build pool: {e}")))?;
        Ok(Self {
            pool,
            breaker: std::sync::Arc::new(CircuitBreaker::default()),
        })
    }

    pub fn get(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Cheap, idempotent ping. Does not affect the breaker on failure: a
    /// monitoring probe observes health, it does not itself trip the breaker.
    pub async fn health_check(&self) -> Result<()> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| RepositoryError::connection(e.to_string()))?;
            conn.query_row("SELECT 1", [], |_| Ok(())).map_err(RepositoryError::from)
        })
        .await
        .map_err(|e| RepositoryError::connection(format!("health check task panicked: {e}")))?
    }

    /// Run a scoped multi-op atomic block: `f` receives a live transaction;
    /// if it returns `Ok`, the transaction commits; any `Err` rolls it all
    /// back (including partial work from earlier statements in the scope).
    pub async fn atomic<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| RepositoryError::connection(e.to_string()))?;
            let tx = conn
                .transaction()
                .map_err(|e| RepositoryError::transaction(e.to_string()))?;
            match f(&tx) {
                Ok(value) => {
                    tx.commit()
                        .map_err(|e| RepositoryError::transaction(e.to_string()))?;
                    Ok(value)
                }
                Err(e) => {
                    // Transaction is rolled back on drop; surface the original error.
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| RepositoryError::transaction(format!("atomic block task panicked: {e}")))?
    }

    /// Run a blocking read/write closure against a checked-out connection
    /// off the async executor.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| RepositoryError::connection(e.to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| RepositoryError::connection(format!("db task panicked: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_check_succeeds_on_fresh_db() {
        let pool = DbPool::open_in_memory().unwrap();
        pool.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn atomic_rolls_back_on_error() {
        let pool = DbPool::open_in_memory().unwrap();
        pool.with_conn(|conn| {
            conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")?;
            Ok(())
        })
        .await
        .unwrap();

        let result: Result<()> = pool
            .atomic(|tx| {
                tx.execute("INSERT INTO t (v) VALUES (?1)", ["a"])
                    .map_err(RepositoryError::from)?;
                Err(RepositoryError::validation("force rollback"))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = pool
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
                    .map_err(RepositoryError::from)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
