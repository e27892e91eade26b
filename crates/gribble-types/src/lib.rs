//! Shared domain types for Gribble.
//!
//! This crate contains the types passed between the storage layer and its
//! consumers: `Runner`, the `RepositoryError` taxonomy, and configuration.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod config;
pub mod error;
pub mod runner;
