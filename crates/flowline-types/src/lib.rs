//! Shared domain types for Flowline.
//!
//! This crate contains the core domain types of the flow execution engine:
//! flow graphs, executions, node execution log entries, target entities,
//! configuration, events and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod execution;
pub mod flow;
