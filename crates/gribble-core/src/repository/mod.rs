//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (gribble-infra) implements.

pub mod runner;
