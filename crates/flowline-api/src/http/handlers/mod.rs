//! HTTP request handlers for the internal API.

pub mod advance;
pub mod execution;
pub mod flow;
