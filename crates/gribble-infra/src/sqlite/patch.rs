//! Versioned, forward-only schema patches.
//!
//! A [`Patch`] belongs to a component and carries a version. A [`PatchSet`]
//! applies its patches in order; each unapplied patch runs inside its own
//! savepoint together with the `versions` upsert that records it, so either
//! both persist or neither does.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use gribble_types::error::RepositoryError;
use sqlx::SqliteConnection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::savepoint::run_in_savepoint;
use super::{db_error, exec_transient};

/// One migration step.
pub trait Patch: Send + Sync {
    fn name(&self) -> &str;

    /// The independently versioned subsystem this patch belongs to.
    fn component(&self) -> &str;

    fn version(&self) -> i64;

    /// Apply the schema change. Runs inside a savepoint owned by the caller.
    fn apply<'c>(
        &'c self,
        cancel: &'c CancellationToken,
        conn: &'c mut SqliteConnection,
    ) -> BoxFuture<'c, Result<(), RepositoryError>>;
}

/// A patch made of SQL statements executed in order.
#[derive(Debug, Clone)]
pub struct StatementPatch {
    name: String,
    component: String,
    version: i64,
    statements: Vec<String>,
}

impl StatementPatch {
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        component: impl Into<String>,
        version: i64,
        statements: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            name: name.into(),
            component: component.into(),
            version,
            statements: statements.into_iter().map(Into::into).collect(),
        }
    }
}

impl Patch for StatementPatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn component(&self) -> &str {
        &self.component
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply<'c>(
        &'c self,
        cancel: &'c CancellationToken,
        conn: &'c mut SqliteConnection,
    ) -> BoxFuture<'c, Result<(), RepositoryError>> {
        Box::pin(async move {
            for sql in &self.statements {
                if cancel.is_cancelled() {
                    return Err(RepositoryError::Cancelled);
                }
                exec_transient(conn, sql).await?;
            }
            Ok(())
        })
    }
}

type ApplyFn = dyn for<'c> Fn(
        &'c CancellationToken,
        &'c mut SqliteConnection,
    ) -> BoxFuture<'c, Result<(), RepositoryError>>
    + Send
    + Sync;

/// A patch whose work is an arbitrary async function, for data migrations
/// that cannot be written as plain statements.
pub struct FnPatch {
    name: String,
    component: String,
    version: i64,
    apply: Box<ApplyFn>,
}

impl FnPatch {
    pub fn new<F>(
        name: impl Into<String>,
        component: impl Into<String>,
        version: i64,
        apply: F,
    ) -> Self
    where
        F: for<'c> Fn(
                &'c CancellationToken,
                &'c mut SqliteConnection,
            ) -> BoxFuture<'c, Result<(), RepositoryError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            component: component.into(),
            version,
            apply: Box::new(apply),
        }
    }
}

impl fmt::Debug for FnPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPatch")
            .field("name", &self.name)
            .field("component", &self.component)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Patch for FnPatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn component(&self) -> &str {
        &self.component
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply<'c>(
        &'c self,
        cancel: &'c CancellationToken,
        conn: &'c mut SqliteConnection,
    ) -> BoxFuture<'c, Result<(), RepositoryError>> {
        (self.apply)(cancel, conn)
    }
}

/// An immutable, ordered list of patches.
#[derive(Clone, Default)]
pub struct PatchSet {
    patches: Arc<[Arc<dyn Patch>]>,
}

impl PatchSet {
    pub fn new(patches: Vec<Arc<dyn Patch>>) -> Self {
        Self {
            patches: patches.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Patch>> {
        self.patches.iter()
    }

    /// Apply every patch not yet recorded, in order, stopping at the first
    /// failure.
    ///
    /// A patch is skipped when its component already has a recorded version
    /// greater than or equal to the patch's own.
    pub async fn apply(
        &self,
        cancel: &CancellationToken,
        conn: &mut SqliteConnection,
    ) -> Result<(), RepositoryError> {
        for (i, patch) in self.patches.iter().enumerate() {
            let savepoint = format!("{:06}_{}", i + 1, patch.name());
            apply_patch(cancel, conn, &savepoint, Arc::clone(patch)).await?;
        }
        Ok(())
    }
}

impl FromIterator<Arc<dyn Patch>> for PatchSet {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Patch>>>(iter: I) -> Self {
        Self {
            patches: iter.into_iter().collect(),
        }
    }
}

impl fmt::Debug for PatchSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.patches.iter().map(|p| (p.name(), p.component(), p.version())))
            .finish()
    }
}

async fn apply_patch(
    cancel: &CancellationToken,
    conn: &mut SqliteConnection,
    savepoint: &str,
    patch: Arc<dyn Patch>,
) -> Result<(), RepositoryError> {
    if cancel.is_cancelled() {
        return Err(RepositoryError::Cancelled);
    }

    let applied: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM versions WHERE component = ? AND version >= ? LIMIT 1",
    )
    .bind(patch.component())
    .bind(patch.version())
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error)?;

    if applied > 0 {
        debug!(
            patch = patch.name(),
            component = patch.component(),
            version = patch.version(),
            "Patch already applied"
        );
        return Ok(());
    }

    let token = cancel.clone();
    let work = Arc::clone(&patch);
    run_in_savepoint(cancel, conn, savepoint, move |conn| {
        Box::pin(async move {
            work.apply(&token, conn).await?;
            record_version(conn, work.component(), work.version()).await
        })
    })
    .await?;

    info!(
        patch = patch.name(),
        component = patch.component(),
        version = patch.version(),
        "Applied patch"
    );
    Ok(())
}

async fn record_version(
    conn: &mut SqliteConnection,
    component: &str,
    version: i64,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO versions (component, version) VALUES (?, ?)
         ON CONFLICT (component) DO UPDATE SET version = excluded.version",
    )
    .bind(component)
    .bind(version)
    .execute(conn)
    .await
    .map_err(db_error)?;
    Ok(())
}
