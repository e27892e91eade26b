//! SQLite runner repository implementation.
//!
//! Implements `RunnerRepository` from `gribble-core`. Writes that touch more
//! than one row run inside an automatically named savepoint.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gribble_core::clock::{Clock, SystemClock};
use gribble_core::repository::runner::RunnerRepository;
use gribble_types::error::RepositoryError;
use gribble_types::runner::{Runner, RunnerId};
use sqlx::{Row, SqliteConnection};
use tokio_util::sync::CancellationToken;

use super::db_error;
use super::pool::{DatabasePool, PooledConnection};
use super::savepoint::{run_in_savepoint, SavepointNamer};
use super::time::{duration_to_nanos, from_secs, nanos_to_duration, to_secs};

/// SQLite-backed implementation of `RunnerRepository`.
pub struct SqliteRunnerRepository {
    pool: DatabasePool,
    clock: Arc<dyn Clock>,
}

impl SqliteRunnerRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    /// Create a repository that stamps rows using `clock`.
    pub fn with_clock(pool: DatabasePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    async fn connection(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection, RepositoryError> {
        self.pool
            .acquire(cancel)
            .await
            .ok_or(RepositoryError::NoConnection)
    }
}

/// Internal row type for mapping SQLite rows to domain Runner.
struct RunnerRow {
    id: i64,
    token: String,
    description: Option<String>,
    run_untagged: i64,
    locked: i64,
    active: i64,
    max_timeout: i64,
    deleted: i64,
    created_time: Option<f64>,
    updated_time: Option<f64>,
}

impl RunnerRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            token: row.try_get("token")?,
            description: row.try_get("description")?,
            run_untagged: row.try_get("run_untagged")?,
            locked: row.try_get("locked")?,
            active: row.try_get("active")?,
            max_timeout: row.try_get("max_timeout")?,
            deleted: row.try_get("deleted")?,
            created_time: row.try_get("created_time")?,
            updated_time: row.try_get("updated_time")?,
        })
    }

    fn into_runner(self) -> Runner {
        Runner {
            id: Some(RunnerId(self.id)),
            token: self.token,
            description: self.description.unwrap_or_default(),
            tags: Vec::new(),
            run_untagged: self.run_untagged != 0,
            locked: self.locked != 0,
            max_timeout: nanos_to_duration(self.max_timeout),
            active: self.active != 0,
            deleted: self.deleted != 0,
            created: self.created_time.and_then(from_secs),
            updated: self.updated_time.and_then(from_secs),
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), RepositoryError> {
    if cancel.is_cancelled() {
        return Err(RepositoryError::Cancelled);
    }
    Ok(())
}

/// Insert `runner` and link its tags. Returns the stored runner.
async fn insert_runner(
    cancel: CancellationToken,
    conn: &mut SqliteConnection,
    namer: Arc<dyn SavepointNamer>,
    mut runner: Runner,
    now: DateTime<Utc>,
) -> Result<Runner, RepositoryError> {
    let result = sqlx::query(
        "INSERT INTO runners (token, description, run_untagged, locked, max_timeout, active, created_time, updated_time)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&runner.token)
    .bind(&runner.description)
    .bind(runner.run_untagged)
    .bind(runner.locked)
    .bind(duration_to_nanos(runner.max_timeout))
    .bind(runner.active)
    .bind(to_secs(Some(now)))
    .bind(to_secs(Some(now)))
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    let id = RunnerId(result.last_insert_rowid());
    runner.id = Some(id);
    runner.deleted = false;
    runner.created = Some(now);
    runner.updated = Some(now);

    if !runner.tags.is_empty() {
        let savepoint = namer.next_name();
        let tags = std::mem::take(&mut runner.tags);
        let token = cancel.clone();
        runner.tags = run_in_savepoint(&cancel, conn, &savepoint, move |conn| {
            Box::pin(link_tags(token, conn, id, tags))
        })
        .await?;
    }

    Ok(runner)
}

/// Make the runner's links equal `tags`. Returns the sorted, de-duplicated
/// tag set that was stored.
async fn link_tags(
    cancel: CancellationToken,
    conn: &mut SqliteConnection,
    runner: RunnerId,
    mut tags: Vec<String>,
) -> Result<Vec<String>, RepositoryError> {
    tags.sort();
    tags.dedup();

    if tags.is_empty() {
        check_cancelled(&cancel)?;
        sqlx::query("DELETE FROM runner_tags WHERE runner = ?")
            .bind(runner.0)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
        return Ok(tags);
    }

    let mut tag_ids = Vec::with_capacity(tags.len());
    for tag in &tags {
        check_cancelled(&cancel)?;
        tag_ids.push(ensure_tag(conn, tag).await?);
    }

    check_cancelled(&cancel)?;
    let unlink = format!(
        "DELETE FROM runner_tags WHERE runner = ? AND tag NOT IN ({})",
        id_list(&tag_ids)
    );
    sqlx::query(&unlink)
        .persistent(false)
        .bind(runner.0)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;

    for tag_id in &tag_ids {
        check_cancelled(&cancel)?;
        sqlx::query("INSERT OR IGNORE INTO runner_tags (tag, runner) VALUES (?, ?)")
            .bind(tag_id)
            .bind(runner.0)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
    }

    Ok(tags)
}

/// Get-or-create a tag by name, returning its id.
async fn ensure_tag(conn: &mut SqliteConnection, tag: &str) -> Result<i64, RepositoryError> {
    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM tags WHERE tag = ?")
        .bind(tag)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let result = sqlx::query("INSERT INTO tags (tag) VALUES (?)")
        .bind(tag)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    Ok(result.last_insert_rowid())
}

fn id_list(ids: &[i64]) -> String {
    ids.iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

impl RunnerRepository for SqliteRunnerRepository {
    async fn create_runner(
        &self,
        cancel: &CancellationToken,
        runner: &mut Runner,
    ) -> Result<(), RepositoryError> {
        runner.can_create()?;

        let mut conn = self.connection(cancel).await?;
        let savepoint = self.pool.next_savepoint_name();
        let pending = runner.clone();
        let now = self.clock.now();
        let namer = self.pool.namer();
        let token = cancel.clone();

        let result = run_in_savepoint(cancel, &mut conn, &savepoint, move |conn| {
            Box::pin(insert_runner(token, conn, namer, pending, now))
        })
        .await;
        self.pool.release(conn);

        *runner = result?;
        Ok(())
    }

    async fn tag_runner(
        &self,
        cancel: &CancellationToken,
        runner: &mut Runner,
        tags: &[String],
    ) -> Result<(), RepositoryError> {
        let id = runner.require_id()?;

        let mut conn = self.connection(cancel).await?;
        let savepoint = self.pool.next_savepoint_name();
        let tags = tags.to_vec();
        let token = cancel.clone();

        let result = run_in_savepoint(cancel, &mut conn, &savepoint, move |conn| {
            Box::pin(link_tags(token, conn, id, tags))
        })
        .await;
        self.pool.release(conn);

        runner.tags = result?;
        Ok(())
    }

    async fn set_runner_updated_time(
        &self,
        cancel: &CancellationToken,
        runner: &mut Runner,
        time: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let id = runner.require_id()?;

        let mut conn = self.connection(cancel).await?;
        let result = sqlx::query("UPDATE runners SET updated_time = ? WHERE id = ?")
            .bind(to_secs(Some(time)))
            .bind(id.0)
            .execute(&mut *conn)
            .await;
        self.pool.release(conn);

        if result.map_err(db_error)?.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        runner.updated = Some(time);
        Ok(())
    }

    async fn get_runner_by_token(
        &self,
        cancel: &CancellationToken,
        token: &str,
        include_deleted: bool,
    ) -> Result<Runner, RepositoryError> {
        let mut conn = self.connection(cancel).await?;
        let row = sqlx::query(
            "SELECT id, token, description, run_untagged, locked, active, max_timeout, deleted, created_time, updated_time
             FROM runners
             WHERE token = ?
             LIMIT 1",
        )
        .bind(token)
        .fetch_optional(&mut *conn)
        .await;
        self.pool.release(conn);

        let row = row.map_err(db_error)?.ok_or(RepositoryError::NotFound)?;
        let runner = RunnerRow::from_row(&row).map_err(db_error)?.into_runner();

        if runner.deleted && !include_deleted {
            return Err(RepositoryError::NotFound);
        }
        Ok(runner)
    }

    async fn get_runner_tags(
        &self,
        cancel: &CancellationToken,
        runner: &mut Runner,
    ) -> Result<(), RepositoryError> {
        let id = runner.require_id()?;

        let mut conn = self.connection(cancel).await?;
        let tags: Result<Vec<String>, _> = sqlx::query_scalar(
            "SELECT tags.tag FROM runner_tags
             INNER JOIN tags ON runner_tags.tag = tags.id
             WHERE runner_tags.runner = ?
             ORDER BY tags.tag",
        )
        .bind(id.0)
        .fetch_all(&mut *conn)
        .await;
        self.pool.release(conn);

        runner.tags = tags.map_err(db_error)?;
        Ok(())
    }

    async fn retire_runner(
        &self,
        cancel: &CancellationToken,
        runner: &mut Runner,
    ) -> Result<(), RepositoryError> {
        let id = runner.require_id()?;
        let now = self.clock.now();

        let mut conn = self.connection(cancel).await?;
        let result = sqlx::query("UPDATE runners SET deleted = 1, updated_time = ? WHERE id = ?")
            .bind(to_secs(Some(now)))
            .bind(id.0)
            .execute(&mut *conn)
            .await;
        self.pool.release(conn);

        if result.map_err(db_error)?.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        runner.deleted = true;
        runner.updated = Some(now);
        Ok(())
    }
}
