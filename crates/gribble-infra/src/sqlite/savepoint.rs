//! Named, nestable transaction scopes.
//!
//! [`run_in_savepoint`] opens `SAVEPOINT <name>`, runs a unit of work on the
//! connection, and then always cleans up: it rolls back to the savepoint if
//! the work failed, panicked, or was cancelled, and releases the savepoint in
//! every case. A savepoint opened outside any transaction starts one, and
//! releasing it commits. Opened inside another savepoint it nests, and the
//! outer scope only sees the inner scope's returned error.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use gribble_types::error::RepositoryError;
use sqlx::SqliteConnection;
use tokio_util::sync::CancellationToken;

use super::exec_transient;
use super::quote::quote_identifier;

/// Source of savepoint names.
///
/// Names must not repeat on one connection while a savepoint with the same
/// name could still be open.
pub trait SavepointNamer: Send + Sync {
    fn next_name(&self) -> String;
}

/// Names of the form `gribble/autosave/<counter>/<unix nanos>`, both numbers in
/// base 32.
///
/// The counter keeps sequential names on one connection distinct; the
/// timestamp keeps names from different processes apart.
#[derive(Debug)]
pub struct AutosaveNamer {
    counter: AtomicU64,
}

impl AutosaveNamer {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for AutosaveNamer {
    fn default() -> Self {
        Self::new()
    }
}

impl SavepointNamer for AutosaveNamer {
    fn next_name(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let nanos = Utc::now()
            .timestamp_nanos_opt()
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or_default();
        format!("gribble/autosave/{}/{}", base32(id), base32(nanos))
    }
}

/// Deterministic names `<prefix>/1`, `<prefix>/2`, ...
#[derive(Debug)]
pub struct SequenceNamer {
    prefix: String,
    next: AtomicU64,
}

impl SequenceNamer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl SavepointNamer for SequenceNamer {
    fn next_name(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}/{n}", self.prefix)
    }
}

fn base32(mut n: u64) -> String {
    const DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 32) as usize]);
        n /= 32;
    }
    buf.reverse();
    String::from_utf8_lossy(&buf).into_owned()
}

/// How the unit of work ended.
enum Outcome<T> {
    Completed(T),
    Failed(RepositoryError),
    Panicked(Box<dyn Any + Send>),
}

impl<T> Outcome<T> {
    fn completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }
}

/// Failures from the rollback and release statements.
struct Cleanup {
    rollback: Option<RepositoryError>,
    release: Option<RepositoryError>,
}

impl Cleanup {
    /// Roll back unless the work completed, then release unconditionally.
    async fn run(conn: &mut SqliteConnection, quoted: &str, completed: bool) -> Self {
        let rollback = if completed {
            None
        } else {
            exec_transient(conn, &format!("ROLLBACK TRANSACTION TO SAVEPOINT {quoted}"))
                .await
                .err()
        };
        let release = exec_transient(conn, &format!("RELEASE SAVEPOINT {quoted}"))
            .await
            .err();
        Self { rollback, release }
    }

    /// Pick the result: panic > rollback error > release error > work error.
    fn finish<T>(self, savepoint: &str, outcome: Outcome<T>) -> Result<T, RepositoryError> {
        let failure = match outcome {
            Outcome::Panicked(payload) => {
                if let Some(err) = &self.rollback {
                    tracing::error!(savepoint, error = %err, "rollback failed while unwinding");
                }
                if let Some(err) = &self.release {
                    tracing::error!(savepoint, error = %err, "release failed while unwinding");
                }
                std::panic::resume_unwind(payload);
            }
            Outcome::Completed(value) => {
                return match self.release {
                    None => Ok(value),
                    Some(cause) => Err(RepositoryError::Release {
                        savepoint: savepoint.to_string(),
                        cause: Box::new(cause),
                    }),
                };
            }
            Outcome::Failed(err) => err,
        };

        match (self.rollback, self.release) {
            (Some(cause), release) => Err(RepositoryError::Rollback {
                savepoint: savepoint.to_string(),
                cause: Box::new(cause),
                original: Box::new(failure),
                release: release.map(Box::new),
            }),
            (None, Some(cause)) => Err(RepositoryError::Release {
                savepoint: savepoint.to_string(),
                cause: Box::new(cause),
            }),
            (None, None) => Err(failure),
        }
    }
}

/// Run `work` inside the savepoint `name` on `conn`.
///
/// Fails with `Cancelled` before touching the connection if `cancel` has
/// already fired. A panic inside `work` is re-raised after the savepoint has
/// been rolled back and released.
pub async fn run_in_savepoint<T, F>(
    cancel: &CancellationToken,
    conn: &mut SqliteConnection,
    name: &str,
    work: F,
) -> Result<T, RepositoryError>
where
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, RepositoryError>>,
{
    if cancel.is_cancelled() {
        return Err(RepositoryError::Cancelled);
    }

    // Savepoint names cannot be bound parameters.
    let quoted = quote_identifier(name);
    exec_transient(conn, &format!("SAVEPOINT {quoted}")).await?;

    let outcome = match AssertUnwindSafe(work(&mut *conn)).catch_unwind().await {
        Ok(Ok(_)) if cancel.is_cancelled() => Outcome::Failed(RepositoryError::Cancelled),
        Ok(Ok(value)) => Outcome::Completed(value),
        Ok(Err(err)) => Outcome::Failed(err),
        Err(payload) => Outcome::Panicked(payload),
    };

    let cleanup = Cleanup::run(conn, &quoted, outcome.completed()).await;
    cleanup.finish(name, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::{test_pool, PooledConnection};
    use std::time::Duration;

    async fn setup() -> PooledConnection {
        let pool = test_pool(1).await;
        let mut conn = pool.acquire(&CancellationToken::new()).await.unwrap();
        exec_transient(&mut conn, "CREATE TABLE items (x INTEGER)")
            .await
            .unwrap();
        conn
    }

    async fn items(conn: &mut SqliteConnection) -> Vec<i64> {
        sqlx::query_scalar("SELECT x FROM items ORDER BY x")
            .fetch_all(conn)
            .await
            .unwrap()
    }

    async fn insert(conn: &mut SqliteConnection, x: i64) -> Result<(), RepositoryError> {
        sqlx::query("INSERT INTO items (x) VALUES (?)")
            .bind(x)
            .execute(conn)
            .await
            .map(|_| ())
            .map_err(crate::sqlite::db_error)
    }

    async fn explode(conn: &mut SqliteConnection) -> Result<(), RepositoryError> {
        insert(conn, 99).await?;
        panic!("work exploded");
    }

    #[tokio::test]
    async fn test_success_commits() {
        let mut conn = setup().await;
        let cancel = CancellationToken::new();

        let value = run_in_savepoint(&cancel, &mut conn, "commit", |conn| {
            Box::pin(async move {
                insert(conn, 1).await?;
                insert(conn, 2).await?;
                Ok::<_, RepositoryError>(42)
            })
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(items(&mut conn).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_error_rolls_back_and_is_returned() {
        let mut conn = setup().await;
        let cancel = CancellationToken::new();

        let err = run_in_savepoint(&cancel, &mut conn, "fail", |conn| {
            Box::pin(async move {
                insert(conn, 1).await?;
                Err::<(), _>(RepositoryError::Query("failed".to_string()))
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RepositoryError::Query(ref m) if m == "failed"));
        assert!(items(&mut conn).await.is_empty());
    }

    #[tokio::test]
    async fn test_panic_rolls_back_then_propagates() {
        let mut conn = setup().await;
        let cancel = CancellationToken::new();

        let caught = AssertUnwindSafe(run_in_savepoint(&cancel, &mut conn, "boom", |conn| {
            Box::pin(explode(conn))
        }))
        .catch_unwind()
        .await;

        let payload = caught.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"work exploded"));
        assert!(items(&mut conn).await.is_empty());

        // The savepoint was released, so the name is free again.
        run_in_savepoint(&cancel, &mut conn, "boom", |conn| Box::pin(insert(conn, 5)))
            .await
            .unwrap();
        assert_eq!(items(&mut conn).await, vec![5]);
    }

    #[tokio::test]
    async fn test_dropped_work_is_rolled_back_on_release() {
        let pool = test_pool(1).await;
        let cancel = CancellationToken::new();
        let mut conn = pool.acquire(&cancel).await.unwrap();
        exec_transient(&mut conn, "CREATE TABLE items (x INTEGER)")
            .await
            .unwrap();

        let timed_out = tokio::time::timeout(
            Duration::from_millis(100),
            run_in_savepoint(&cancel, &mut conn, "stalled", |conn| {
                Box::pin(async move {
                    insert(conn, 1).await?;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, RepositoryError>(())
                })
            }),
        )
        .await;
        assert!(timed_out.is_err());
        pool.release(conn);

        let mut conn = pool.acquire(&cancel).await.unwrap();
        assert!(items(&mut conn).await.is_empty());

        // Back in autocommit mode: a new savepoint commits for real.
        run_in_savepoint(&cancel, &mut conn, "after", |conn| Box::pin(insert(conn, 2)))
            .await
            .unwrap();
        exec_transient(&mut conn, "BEGIN").await.unwrap();
        exec_transient(&mut conn, "COMMIT").await.unwrap();
        pool.release(conn);

        let mut conn = pool.acquire(&cancel).await.unwrap();
        assert_eq!(items(&mut conn).await, vec![2]);
    }

    #[tokio::test]
    async fn test_already_cancelled_runs_nothing() {
        let mut conn = setup().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_in_savepoint(&cancel, &mut conn, "never", |conn| Box::pin(insert(conn, 1)))
            .await
            .unwrap_err();

        assert!(matches!(err, RepositoryError::Cancelled));
        assert!(items(&mut conn).await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_work_rolls_back() {
        let mut conn = setup().await;
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();

        let err = run_in_savepoint(&cancel, &mut conn, "late", move |conn| {
            Box::pin(async move {
                insert(conn, 1).await?;
                canceller.cancel();
                Ok::<_, RepositoryError>(())
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RepositoryError::Cancelled));
        assert!(items(&mut conn).await.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_failure_keeps_original_and_release_errors() {
        let mut conn = setup().await;
        let cancel = CancellationToken::new();

        // Releasing the savepoint from inside the work makes both cleanup
        // statements fail with "no such savepoint".
        let err = run_in_savepoint(&cancel, &mut conn, "gone", |conn| {
            Box::pin(async move {
                exec_transient(conn, r#"RELEASE SAVEPOINT "gone""#).await?;
                Err::<(), _>(RepositoryError::Query("failed".to_string()))
            })
        })
        .await
        .unwrap_err();

        match err {
            RepositoryError::Rollback {
                savepoint,
                original,
                release,
                ..
            } => {
                assert_eq!(savepoint, "gone");
                assert!(matches!(*original, RepositoryError::Query(ref m) if m == "failed"));
                assert!(release.is_some());
            }
            other => panic!("expected rollback error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_release_failure_supersedes_success() {
        let mut conn = setup().await;
        let cancel = CancellationToken::new();

        let err = run_in_savepoint(&cancel, &mut conn, "early", |conn| {
            Box::pin(async move {
                exec_transient(conn, r#"RELEASE SAVEPOINT "early""#).await?;
                Ok::<_, RepositoryError>(())
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RepositoryError::Release { ref savepoint, .. } if savepoint == "early"));
    }

    #[tokio::test]
    async fn test_inner_rollback_does_not_abort_outer() {
        let mut conn = setup().await;
        let cancel = CancellationToken::new();
        let inner_cancel = cancel.clone();

        run_in_savepoint(&cancel, &mut conn, "outer", move |conn| {
            Box::pin(async move {
                insert(conn, 1).await?;
                let inner = run_in_savepoint(&inner_cancel, conn, "inner", |conn| {
                    Box::pin(async move {
                        insert(conn, 2).await?;
                        Err::<(), _>(RepositoryError::NotFound)
                    })
                })
                .await;
                assert!(matches!(inner, Err(RepositoryError::NotFound)));
                insert(conn, 3).await?;
                Ok::<_, RepositoryError>(())
            })
        })
        .await
        .unwrap();

        assert_eq!(items(&mut conn).await, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_outer_rollback_discards_committed_inner() {
        let mut conn = setup().await;
        let cancel = CancellationToken::new();
        let inner_cancel = cancel.clone();

        let err = run_in_savepoint(&cancel, &mut conn, "outer", move |conn| {
            Box::pin(async move {
                run_in_savepoint(&inner_cancel, conn, "inner", |conn| Box::pin(insert(conn, 2)))
                    .await?;
                Err::<(), _>(RepositoryError::Conflict("later".to_string()))
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert!(items(&mut conn).await.is_empty());
    }

    #[tokio::test]
    async fn test_quoted_names() {
        let mut conn = setup().await;
        let cancel = CancellationToken::new();

        run_in_savepoint(&cancel, &mut conn, r#"we"ird; name"#, |conn| {
            Box::pin(insert(conn, 7))
        })
        .await
        .unwrap();

        assert_eq!(items(&mut conn).await, vec![7]);
    }

    #[test]
    fn test_autosave_names_are_distinct() {
        let namer = AutosaveNamer::new();
        let first = namer.next_name();
        let second = namer.next_name();

        assert_ne!(first, second);
        assert!(first.starts_with("gribble/autosave/1/"));
        assert!(second.starts_with("gribble/autosave/2/"));
    }

    #[test]
    fn test_sequence_namer_is_deterministic() {
        let namer = SequenceNamer::new("test");
        assert_eq!(namer.next_name(), "test/1");
        assert_eq!(namer.next_name(), "test/2");
    }

    #[test]
    fn test_base32() {
        assert_eq!(base32(0), "0");
        assert_eq!(base32(31), "v");
        assert_eq!(base32(32), "10");
        assert_eq!(base32(1025), "101");
    }
}
