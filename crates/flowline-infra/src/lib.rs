//! Infrastructure layer for Flowline.
//!
//! Contains implementations of the ports defined in `flowline-core`:
//! SQLite repositories for flows, executions, the node log and target
//! entities, the HTTP AI-step handler, and the `config.toml` loader.

pub mod ai_handler;
pub mod config;
pub mod sqlite;
