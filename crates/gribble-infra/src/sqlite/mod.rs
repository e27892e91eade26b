//! SQLite storage layer.
//!
//! A bounded connection pool, nestable savepoints, a forward-only patch
//! migrator, and repository implementations built on them.

pub mod migrations;
pub mod patch;
pub mod pool;
pub mod quote;
pub mod runner;
pub mod savepoint;
pub mod time;

use gribble_types::error::RepositoryError;
use sqlx::SqliteConnection;

/// Map a sqlx error onto the repository error taxonomy.
pub(crate) fn db_error(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            RepositoryError::Conflict(db_err.message().to_string())
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => RepositoryError::NoConnection,
        other => RepositoryError::Query(other.to_string()),
    }
}

/// Execute a single statement without caching its prepared form.
///
/// Used for DDL and savepoint statements, whose text is rarely repeated.
pub(crate) async fn exec_transient(
    conn: &mut SqliteConnection,
    sql: &str,
) -> Result<(), RepositoryError> {
    sqlx::query(sql)
        .persistent(false)
        .execute(conn)
        .await
        .map(|_| ())
        .map_err(db_error)
}
