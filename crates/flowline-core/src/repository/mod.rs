//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (flowline-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod entity;
pub mod flow;
pub mod memory;
