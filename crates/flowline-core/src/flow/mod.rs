//! Flow engine: definitions, graph traversal, dispatch and durable
//! continuation-driven execution.
//!
//! - `definition` -- YAML/JSON parsing and validation
//! - `graph` -- entry node, successor selection, pending frontier
//! - `node` -- typed node configs parsed from `NodeDefinition`
//! - `expression` -- JEXL evaluation for condition nodes
//! - `prompt` -- AI-step prompt assembly
//! - `handler` -- AI-step handler port
//! - `dispatcher` -- per-node-type dispatch
//! - `context` -- context snapshots and merge patches
//! - `store` -- optimistic execution updates
//! - `log` -- node execution log and idempotency fence
//! - `engine` -- the `advance` cycle, start and recovery
//! - `scheduler` / `worker` -- continuation delivery

pub mod context;
pub mod definition;
pub mod dispatcher;
pub mod engine;
pub mod expression;
pub mod graph;
pub mod handler;
pub mod log;
pub mod node;
pub mod prompt;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use engine::{AdvanceOutcome, AdvanceRequest, EngineError, EngineSettings, FlowEngine, StartRequest};
pub use scheduler::{ChannelScheduler, Continuation, ContinuationScheduler, InlineScheduler};
