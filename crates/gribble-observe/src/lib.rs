//! Logging setup for Gribble binaries.

pub mod tracing_setup;
