//! Flow engine logic and repository trait definitions for Flowline.
//!
//! This crate defines the "ports" (repository traits, AI-step handler) that
//! the infrastructure layer implements. It depends only on
//! `flowline-types` -- never on `flowline-infra` or any database/IO crate.

pub mod event;
pub mod flow;
pub mod repository;
