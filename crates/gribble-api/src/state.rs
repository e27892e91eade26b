//! Application state wiring storage together.
//!
//! AppState opens the pool, brings the schema up to date and pins the
//! repository to its SQLite implementation.

use std::sync::Arc;

use anyhow::Context;
use gribble_infra::sqlite::migrations::system_patches;
use gribble_infra::sqlite::pool::DatabasePool;
use gribble_infra::sqlite::runner::SqliteRunnerRepository;
use gribble_types::config::GribbleConfig;
use tokio_util::sync::CancellationToken;

/// Shared application state used by every command.
#[derive(Clone)]
pub struct AppState {
    pub pool: DatabasePool,
    pub runners: Arc<SqliteRunnerRepository>,
    /// Cancelled on Ctrl+C.
    pub cancel: CancellationToken,
}

impl AppState {
    /// Open the database and apply the system patches.
    pub async fn init(config: &GribbleConfig) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_interrupt.cancel();
            }
        });

        let pool = DatabasePool::open(&config.storage)
            .await
            .with_context(|| format!("opening {} database", config.storage.backend))?;

        if let Err(err) = pool.migrate(&cancel, &system_patches()).await {
            pool.close().await;
            return Err(err).context("applying schema patches");
        }

        let runners = Arc::new(SqliteRunnerRepository::new(pool.clone()));

        Ok(Self {
            pool,
            runners,
            cancel,
        })
    }

    pub async fn shutdown(&self) {
        self.pool.close().await;
    }
}
