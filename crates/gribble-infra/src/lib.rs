//! Infrastructure layer for Gribble.
//!
//! Contains the SQLite implementation of the repository traits defined in
//! `gribble-core`: a bounded connection pool, savepoint-scoped transactions,
//! the versioned schema migrator, and the runner repository. Also loads the
//! TOML configuration file.

pub mod config;
pub mod sqlite;
