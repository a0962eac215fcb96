//! Continuation scheduling.
//!
//! The engine never calls itself recursively. After a merge it hands each
//! selected successor to a [`ContinuationScheduler`], which delivers it
//! back to `FlowEngine::advance` later:
//! - [`InlineScheduler`] queues in memory and is drained by the caller
//!   (tests, one-shot CLI runs).
//! - [`ChannelScheduler`] feeds a `ContinuationWorker` over an mpsc
//!   channel (long-running server).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use flowline_types::config::EngineConfig;
use flowline_types::execution::ExecutionContext;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::engine::{AdvanceOutcome, AdvanceRequest, EngineError, FlowEngine};
use crate::repository::entity::EntityRepository;
use crate::repository::flow::FlowRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("continuation queue is closed")]
    Closed,

    #[error("scheduler rejected continuation: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Continuation
// ---------------------------------------------------------------------------

/// "Run node N of execution E after `delay`."
#[derive(Debug, Clone, PartialEq)]
pub struct Continuation {
    pub execution_id: Uuid,
    pub node_id: String,
    pub context: ExecutionContext,
    pub is_retry: bool,
    pub delay: Duration,
    /// 1-based delivery counter, bumped on every redelivery.
    pub delivery: u32,
}

impl Continuation {
    pub fn new(execution_id: Uuid, node_id: &str, delay: Duration) -> Self {
        Self {
            execution_id,
            node_id: node_id.to_string(),
            context: ExecutionContext::new(),
            is_retry: false,
            delay,
            delivery: 1,
        }
    }

    /// The same continuation marked as a retry, delayed by `backoff`.
    pub fn redelivery(&self, backoff: Duration) -> Self {
        Self {
            is_retry: true,
            delay: backoff,
            delivery: self.delivery + 1,
            ..self.clone()
        }
    }
}

/// Sink for continuations produced by the engine.
///
/// `schedule` is synchronous: implementations enqueue and return, they never
/// run the engine themselves.
pub trait ContinuationScheduler: Send + Sync {
    fn schedule(&self, continuation: Continuation) -> Result<(), SchedulerError>;
}

// ---------------------------------------------------------------------------
// Redelivery policy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for retryable `advance` failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    pub max_deliveries: u32,
    pub base_backoff: Duration,
}

impl RedeliveryPolicy {
    /// Whether a continuation that just failed on `delivery` may go again.
    pub fn should_redeliver(&self, delivery: u32) -> bool {
        delivery < self.max_deliveries
    }

    /// Backoff before delivery `delivery + 1`: base, 2x base, 4x base...
    pub fn backoff(&self, delivery: u32) -> Duration {
        let exponent = delivery.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1u32 << exponent)
    }
}

impl From<&EngineConfig> for RedeliveryPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_deliveries: config.max_delivery_attempts.max(1),
            base_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// InlineScheduler
// ---------------------------------------------------------------------------

/// In-process FIFO scheduler drained explicitly by the caller.
///
/// Keeps a history of everything ever scheduled so callers can check
/// which continuations the engine issued.
pub struct InlineScheduler {
    queue: Mutex<VecDeque<Continuation>>,
    history: Mutex<Vec<Continuation>>,
    honor_delay: bool,
    policy: RedeliveryPolicy,
}

impl InlineScheduler {
    /// Scheduler that ignores continuation delays.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            history: Mutex::new(Vec::new()),
            honor_delay: false,
            policy: RedeliveryPolicy {
                max_deliveries: 5,
                base_backoff: Duration::ZERO,
            },
        }
    }

    /// Sleep for each continuation's delay before delivering it.
    pub fn with_delays(mut self, policy: RedeliveryPolicy) -> Self {
        self.honor_delay = true;
        self.policy = policy;
        self
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Every continuation scheduled so far, in order.
    pub fn history(&self) -> Vec<Continuation> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Remove and return the next queued continuation without running it.
    pub fn pop(&self) -> Option<Continuation> {
        self.queue.lock().ok()?.pop_front()
    }

    /// Deliver queued continuations until the queue is empty.
    ///
    /// Retryable failures are requeued as retries up to the policy limit;
    /// everything else is logged and dropped. Returns the outcomes of
    /// successful deliveries in order.
    pub async fn drain<R, E>(&self, engine: &FlowEngine<R, E>) -> Vec<AdvanceOutcome>
    where
        R: FlowRepository,
        E: EntityRepository,
    {
        let mut outcomes = Vec::new();
        while let Some(continuation) = self.pop() {
            if self.honor_delay && !continuation.delay.is_zero() {
                tokio::time::sleep(continuation.delay).await;
            }
            match engine.advance(AdvanceRequest::from(continuation.clone())).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => self.handle_failure(&continuation, &e),
            }
        }
        outcomes
    }

    fn handle_failure(&self, continuation: &Continuation, error: &EngineError) {
        if error.is_retryable() && self.policy.should_redeliver(continuation.delivery) {
            tracing::debug!(
                execution_id = %continuation.execution_id,
                node_id = continuation.node_id.as_str(),
                delivery = continuation.delivery,
                error = %error,
                "redelivering continuation"
            );
            let next = continuation.redelivery(self.policy.backoff(continuation.delivery));
            if let Ok(mut queue) = self.queue.lock() {
                queue.push_back(next);
            }
        } else {
            tracing::warn!(
                execution_id = %continuation.execution_id,
                node_id = continuation.node_id.as_str(),
                delivery = continuation.delivery,
                error = %error,
                "dropping continuation"
            );
        }
    }
}

impl Default for InlineScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ContinuationScheduler for InlineScheduler {
    fn schedule(&self, continuation: Continuation) -> Result<(), SchedulerError> {
        if let Ok(mut history) = self.history.lock() {
            history.push(continuation.clone());
        }
        self.queue
            .lock()
            .map_err(|_| SchedulerError::Rejected("queue lock poisoned".to_string()))?
            .push_back(continuation);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ChannelScheduler
// ---------------------------------------------------------------------------

/// Scheduler backed by an unbounded mpsc channel. The receiving half is
/// consumed by a `ContinuationWorker`.
#[derive(Debug, Clone)]
pub struct ChannelScheduler {
    sender: mpsc::UnboundedSender<Continuation>,
}

impl ChannelScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Continuation>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ContinuationScheduler for ChannelScheduler {
    fn schedule(&self, continuation: Continuation) -> Result<(), SchedulerError> {
        self.sender
            .send(continuation)
            .map_err(|_| SchedulerError::Closed)
    }
}
