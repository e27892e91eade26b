//! System schema and the migration driver.
//!
//! `system_patches()` builds the patch list for the base schema. The pool
//! applies a patch list with [`DatabasePool::migrate`], recording progress in
//! the `versions` table.

use std::sync::Arc;

use gribble_types::error::RepositoryError;
use sqlx::SqliteConnection;
use tokio_util::sync::CancellationToken;

use super::patch::{Patch, PatchSet, StatementPatch};
use super::pool::DatabasePool;
use super::{db_error, exec_transient};

/// Component name for the core Gribble schema.
pub const BASE_SYSTEM: &str = "base-system";

/// A recorded `(component, version)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub component: String,
    pub version: i64,
}

/// The patches that create and evolve the Gribble schema, in order.
pub fn system_patches() -> PatchSet {
    let init: Arc<dyn Patch> = Arc::new(StatementPatch::new(
        "gribble-init",
        BASE_SYSTEM,
        1,
        [
            "CREATE TABLE runners (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token TEXT UNIQUE ON CONFLICT ABORT,
                description TEXT,
                run_untagged BOOLEAN DEFAULT 0,
                locked BOOLEAN DEFAULT 0,
                active BOOLEAN DEFAULT 0,
                max_timeout INTEGER DEFAULT 0,
                deleted BOOLEAN DEFAULT 0,
                created_time REAL,
                updated_time REAL
            )",
            "CREATE TABLE runner_locks (
                runner INTEGER,
                project INTEGER,
                PRIMARY KEY (runner, project),
                FOREIGN KEY (runner) REFERENCES runners(id),
                FOREIGN KEY (project) REFERENCES projects(id)
            )",
            "CREATE TABLE projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT, -- such as 'github'
                source_id NUMERIC,
                name TEXT,
                path TEXT,
                url TEXT,
                clone_url TEXT
            )",
            "CREATE INDEX projects_by_source ON projects (source, source_id)",
            "CREATE TABLE tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tag TEXT UNIQUE ON CONFLICT ABORT
            )",
            "CREATE TABLE runner_tags (
                tag INTEGER,
                runner INTEGER,
                PRIMARY KEY (tag, runner),
                FOREIGN KEY (tag) REFERENCES tags(id),
                FOREIGN KEY (runner) REFERENCES runners(id)
            )",
            "CREATE INDEX runner_tags_by_runner ON runner_tags (runner)",
            "CREATE TABLE jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                runner INTEGER,
                features INTEGER DEFAULT 0,
                state TEXT DEFAULT 'pending',
                project INTEGER,
                spec JSON,
                created_time REAL,
                finished_time REAL,
                FOREIGN KEY (runner) REFERENCES runners(id)
            )",
            "CREATE TABLE job_depends (
                -- dest depends on src
                dest INTEGER,
                src INTEGER CHECK (src < dest),
                fetch_artifacts BOOLEAN DEFAULT 0,
                PRIMARY KEY (src, dest),
                FOREIGN KEY (src) REFERENCES jobs(id),
                FOREIGN KEY (dest) REFERENCES jobs(id)
            )",
        ],
    ));

    PatchSet::new(vec![init])
}

impl DatabasePool {
    /// Apply `patches` on a single pooled connection.
    pub async fn migrate(
        &self,
        cancel: &CancellationToken,
        patches: &PatchSet,
    ) -> Result<(), RepositoryError> {
        let mut conn = self
            .acquire(cancel)
            .await
            .ok_or(RepositoryError::NoConnection)?;
        let result = patches.apply(cancel, &mut conn).await;
        self.release(conn);
        result
    }

    /// List recorded component versions, ordered by component.
    pub async fn versions(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<VersionRecord>, RepositoryError> {
        let mut conn = self
            .acquire(cancel)
            .await
            .ok_or(RepositoryError::NoConnection)?;
        let rows: Result<Vec<(String, i64)>, _> =
            sqlx::query_as("SELECT component, version FROM versions ORDER BY component")
                .fetch_all(&mut *conn)
                .await;
        self.release(conn);

        Ok(rows
            .map_err(db_error)?
            .into_iter()
            .map(|(component, version)| VersionRecord { component, version })
            .collect())
    }

    /// Create the `versions` table unless the catalog already lists it.
    pub(crate) async fn ensure_version_table(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), RepositoryError> {
        let mut conn = self
            .acquire(cancel)
            .await
            .ok_or(RepositoryError::NoConnection)?;
        let result = create_version_table(&mut conn).await;
        self.release(conn);
        result
    }
}

async fn create_version_table(conn: &mut SqliteConnection) -> Result<(), RepositoryError> {
    if have_table(conn, "versions").await? {
        return Ok(());
    }
    exec_transient(
        conn,
        "CREATE TABLE versions (
            component TEXT PRIMARY KEY,
            version INTEGER
        )",
    )
    .await
}

async fn have_table(conn: &mut SqliteConnection, table: &str) -> Result<bool, RepositoryError> {
    let found: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ? LIMIT 1",
    )
    .bind(table)
    .fetch_one(conn)
    .await
    .map_err(db_error)?;
    Ok(found > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::test_pool;
    use gribble_types::config::StorageConfig;

    async fn table_names(pool: &DatabasePool) -> Vec<String> {
        let mut conn = pool.acquire(&CancellationToken::new()).await.unwrap();
        sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&mut *conn)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_version_table_starts_empty() {
        let pool = test_pool(1).await;
        let cancel = CancellationToken::new();

        // A second ensure against an existing table is a no-op.
        pool.ensure_version_table(&cancel).await.unwrap();

        assert!(pool.versions(&cancel).await.unwrap().is_empty());
        assert_eq!(table_names(&pool).await, vec!["versions"]);
    }

    #[tokio::test]
    async fn test_system_patches_apply() {
        let pool = test_pool(2).await;
        let cancel = CancellationToken::new();

        pool.migrate(&cancel, &system_patches()).await.unwrap();

        let tables = table_names(&pool).await;
        for expected in [
            "job_depends",
            "jobs",
            "projects",
            "runner_locks",
            "runner_tags",
            "runners",
            "tags",
            "versions",
        ] {
            assert!(tables.iter().any(|t| t == expected), "{expected} table missing");
        }

        assert_eq!(
            pool.versions(&cancel).await.unwrap(),
            vec![VersionRecord {
                component: BASE_SYSTEM.to_string(),
                version: 1,
            }]
        );
    }

    #[tokio::test]
    async fn test_system_patches_one_at_a_time() {
        let pool = test_pool(1).await;
        let cancel = CancellationToken::new();

        for patch in system_patches().iter() {
            let single = PatchSet::new(vec![Arc::clone(patch)]);
            pool.migrate(&cancel, &single)
                .await
                .unwrap_or_else(|e| panic!("patch {} failed: {e}", patch.name()));
        }
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let pool = test_pool(1).await;
        let cancel = CancellationToken::new();
        let patches = system_patches();

        pool.migrate(&cancel, &patches).await.unwrap();
        let tables = table_names(&pool).await;
        let versions = pool.versions(&cancel).await.unwrap();

        pool.migrate(&cancel, &patches).await.unwrap();
        assert_eq!(table_names(&pool).await, tables);
        assert_eq!(pool.versions(&cancel).await.unwrap(), versions);
    }

    #[tokio::test]
    async fn test_migrate_in_memory() {
        let pool = DatabasePool::open(&StorageConfig::memory(1)).await.unwrap();
        let cancel = CancellationToken::new();

        pool.migrate(&cancel, &system_patches()).await.unwrap();
        assert_eq!(pool.versions(&cancel).await.unwrap().len(), 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_migrate_on_closed_pool() {
        let pool = test_pool(1).await;
        pool.close().await;

        let err = pool
            .migrate(&CancellationToken::new(), &system_patches())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NoConnection));
    }

    #[tokio::test]
    async fn test_reopen_keeps_versions() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            sqlite_file: dir.path().join("reopen.db").display().to_string(),
            pool_size: 1,
            ..Default::default()
        };
        let cancel = CancellationToken::new();

        let pool = DatabasePool::open(&config).await.unwrap();
        pool.migrate(&cancel, &system_patches()).await.unwrap();
        pool.close().await;

        let pool = DatabasePool::open(&config).await.unwrap();
        pool.migrate(&cancel, &system_patches()).await.unwrap();
        assert_eq!(pool.versions(&cancel).await.unwrap().len(), 1);
        pool.close().await;
    }
}
