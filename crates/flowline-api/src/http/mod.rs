//! Internal HTTP surface for Flowline.
//!
//! Axum router at `/internal/v1/` with token authentication and the
//! envelope response format. The scheduler transport calls `advance` here.

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod response;
pub mod router;
