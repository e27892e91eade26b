//! Bounded SQLite connection pool.
//!
//! `DatabasePool` hands out one connection per logical operation. Every
//! connection it hands out has foreign key enforcement switched on, and
//! acquisition honours a caller-supplied cancellation token. Opening a pool
//! ensures the migration version table exists.
//!
//! A connection returned while still inside a transaction (for example when
//! a savepoint future was dropped before its cleanup ran) is rolled back
//! before anyone can acquire it again.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use gribble_types::config::{Backend, StorageConfig};
use gribble_types::error::RepositoryError;
use sqlx::pool::{PoolConnection, PoolConnectionMetadata};
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions,
};
use tokio_util::sync::CancellationToken;

use super::db_error;
use super::savepoint::{AutosaveNamer, SavepointNamer};

/// A connection checked out of a [`DatabasePool`].
pub type PooledConnection = PoolConnection<Sqlite>;

/// Bounded pool of SQLite connections.
///
/// Cloning is cheap; clones share the same underlying connections and
/// closed state.
#[derive(Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
    closed: Arc<AtomicBool>,
    namer: Arc<dyn SavepointNamer>,
}

impl DatabasePool {
    /// Open a pool for the configured backend and ensure the version table.
    pub async fn open(config: &StorageConfig) -> Result<Self, RepositoryError> {
        Self::open_with_namer(config, Arc::new(AutosaveNamer::new())).await
    }

    /// Open a pool whose automatic savepoint names come from `namer`.
    pub async fn open_with_namer(
        config: &StorageConfig,
        namer: Arc<dyn SavepointNamer>,
    ) -> Result<Self, RepositoryError> {
        let mut pool_opts = SqlitePoolOptions::new()
            .max_connections(config.pool_size.max(1))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .after_release(end_abandoned_transaction);

        if config.backend == Backend::SqliteMemory {
            // The in-memory database lives only as long as one connection does.
            pool_opts = pool_opts
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_opts
            .connect_with(connect_options(config)?)
            .await
            .map_err(db_error)?;

        let db = Self {
            pool,
            closed: Arc::new(AtomicBool::new(false)),
            namer,
        };

        if let Err(err) = db.ensure_version_table(&CancellationToken::new()).await {
            db.close().await;
            return Err(err);
        }

        Ok(db)
    }

    /// Check out a connection.
    ///
    /// Waits until a connection is free, the pool's acquire timeout elapses,
    /// or `cancel` fires. Returns `None` when no connection was obtained,
    /// including when the pool is closed.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<PooledConnection> {
        if self.is_closed() || cancel.is_cancelled() {
            return None;
        }

        let mut conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            conn = self.pool.acquire() => conn.ok()?,
        };

        // PRAGMA foreign_keys is per connection and must be set outside a transaction.
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut *conn)
            .await
            .ok()?;

        Some(conn)
    }

    /// Return a connection to the pool. Dropping the connection does the same.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Close the pool and every connection in it. Only the first call has any
    /// effect; later `acquire` calls return `None` immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Generate a savepoint name unique for the lifetime of this process.
    pub fn next_savepoint_name(&self) -> String {
        self.namer.next_name()
    }

    pub(crate) fn namer(&self) -> Arc<dyn SavepointNamer> {
        Arc::clone(&self.namer)
    }
}

/// Restore autocommit mode on a connection coming back to the pool.
///
/// `BEGIN` fails only when a transaction is already open, in which case it is
/// rolled back. An error here makes sqlx close the connection instead of
/// pooling it.
fn end_abandoned_transaction(
    conn: &mut SqliteConnection,
    _meta: PoolConnectionMetadata,
) -> BoxFuture<'_, Result<bool, sqlx::Error>> {
    Box::pin(async move {
        match sqlx::query("BEGIN").persistent(false).execute(&mut *conn).await {
            Ok(_) => {
                sqlx::query("COMMIT").persistent(false).execute(&mut *conn).await?;
            }
            Err(_) => {
                tracing::warn!("Rolling back transaction left open on released connection");
                sqlx::query("ROLLBACK").persistent(false).execute(&mut *conn).await?;
            }
        }
        Ok(true)
    })
}

fn connect_options(config: &StorageConfig) -> Result<SqliteConnectOptions, RepositoryError> {
    let options = match config.backend {
        Backend::Sqlite => SqliteConnectOptions::new()
            .filename(&config.sqlite_file)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal),
        // "sqlite::memory:" yields a uniquely named shared-cache database, so
        // all connections of one pool see the same schema.
        Backend::SqliteMemory => SqliteConnectOptions::from_str("sqlite::memory:").map_err(db_error)?,
    };

    Ok(options
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(config.busy_timeout_secs)))
}

/// Open a pool over a fresh on-disk database in a temporary directory.
#[cfg(test)]
pub(crate) async fn test_pool(pool_size: u32) -> DatabasePool {
    test_pool_with_namer(pool_size, Arc::new(AutosaveNamer::new())).await
}

#[cfg(test)]
pub(crate) async fn test_pool_with_namer(
    pool_size: u32,
    namer: Arc<dyn SavepointNamer>,
) -> DatabasePool {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        sqlite_file: dir.path().join("test.db").display().to_string(),
        pool_size,
        acquire_timeout_secs: 5,
        ..Default::default()
    };
    // Leak tempdir so it lives for the test
    std::mem::forget(dir);
    DatabasePool::open_with_namer(&config, namer).await.unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquired_connection_enforces_foreign_keys() {
        let pool = test_pool(2).await;
        let cancel = CancellationToken::new();

        let mut conn = pool.acquire(&cancel).await.unwrap();
        let (enabled,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(enabled, 1, "foreign keys should be enabled");

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        pool.release(conn);
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let pool = test_pool(1).await;
        let cancel = CancellationToken::new();

        let conn = pool.acquire(&cancel).await.unwrap();
        pool.release(conn);
        assert!(pool.acquire(&cancel).await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_aborts_waiting_acquire() {
        let pool = test_pool(1).await;
        let held = pool.acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        assert!(pool.acquire(&cancel).await.is_none());
        pool.release(held);
    }

    #[tokio::test]
    async fn test_cancelled_token_gets_no_connection() {
        let pool = test_pool(1).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(pool.acquire(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails_fast() {
        let pool = test_pool(2).await;
        let clone = pool.clone();

        pool.close().await;
        pool.close().await;

        assert!(pool.is_closed());
        assert!(clone.is_closed());
        assert!(clone.acquire(&CancellationToken::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_memory_pool_shares_one_database() {
        let pool = DatabasePool::open(&StorageConfig::memory(2)).await.unwrap();
        let cancel = CancellationToken::new();

        let mut first = pool.acquire(&cancel).await.unwrap();
        sqlx::query("CREATE TABLE shared_check (x INTEGER)")
            .execute(&mut *first)
            .await
            .unwrap();

        let mut second = pool.acquire(&cancel).await.unwrap();
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM shared_check")
            .fetch_one(&mut *second)
            .await
            .unwrap();
        assert_eq!(n, 0);

        pool.release(first);
        pool.release(second);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_savepoint_names_are_unique() {
        let pool = test_pool(1).await;
        let a = pool.next_savepoint_name();
        let b = pool.next_savepoint_name();
        assert_ne!(a, b);
        assert!(a.starts_with("gribble/autosave/"));
    }
}
