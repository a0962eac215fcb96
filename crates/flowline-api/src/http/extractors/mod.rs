//! Request extractors for the internal HTTP surface.

pub mod auth;
