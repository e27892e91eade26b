//! Configuration types for Gribble.
//!
//! `GribbleConfig` represents the top-level `gribble.toml`. Every field has a
//! default, so an empty file (or no file) yields a working configuration.

use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GribbleConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Database backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// On-disk SQLite database at `sqlite_file`.
    #[default]
    Sqlite,
    /// Process-private in-memory SQLite database (testing only).
    SqliteMemory,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Sqlite => write!(f, "sqlite"),
            Backend::SqliteMemory => write!(f, "sqlite-memory"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(Backend::Sqlite),
            "sqlite-memory" => Ok(Backend::SqliteMemory),
            other => Err(format!("unrecognized backend '{other}'")),
        }
    }
}

/// Connection pool and database settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default = "default_sqlite_file")]
    pub sqlite_file: String,

    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// How long `acquire` waits for a free connection before giving up.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// SQLite busy handler timeout for lock contention between connections.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_sqlite_file() -> String {
    "gribble.db".to_string()
}

fn default_pool_size() -> u32 {
    8
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_busy_timeout_secs() -> u64 {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            sqlite_file: default_sqlite_file(),
            pool_size: default_pool_size(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

impl StorageConfig {
    /// In-memory configuration with the given pool size.
    pub fn memory(pool_size: u32) -> Self {
        Self {
            backend: Backend::SqliteMemory,
            pool_size,
            ..Default::default()
        }
    }
}

/// Process logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit logs as JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
