//! Repository trait definitions and capabilities for Gribble.
//!
//! This crate defines the "ports" that the infrastructure layer
//! (gribble-infra) implements. It depends only on `gribble-types` -- never on
//! `gribble-infra` or any database crate.

pub mod clock;
pub mod repository;
