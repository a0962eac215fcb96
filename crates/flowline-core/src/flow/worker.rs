//! Background delivery loop for [`ChannelScheduler`] continuations.
//!
//! Each continuation runs on its own task after its delay. Retryable
//! failures go back on the channel as retries with exponential backoff.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::engine::{AdvanceRequest, FlowEngine};
use super::scheduler::{ChannelScheduler, Continuation, ContinuationScheduler, RedeliveryPolicy};
use crate::repository::entity::EntityRepository;
use crate::repository::flow::FlowRepository;

pub struct ContinuationWorker<R: FlowRepository, E: EntityRepository> {
    engine: Arc<FlowEngine<R, E>>,
    requeue: ChannelScheduler,
    policy: RedeliveryPolicy,
    shutdown: CancellationToken,
}

impl<R, E> ContinuationWorker<R, E>
where
    R: FlowRepository + 'static,
    E: EntityRepository + 'static,
{
    /// `requeue` must feed the same channel the worker consumes.
    pub fn new(
        engine: Arc<FlowEngine<R, E>>,
        requeue: ChannelScheduler,
        policy: RedeliveryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            requeue,
            policy,
            shutdown,
        }
    }

    /// Consume continuations until shutdown is requested or every sender is
    /// gone. In-flight deliveries are awaited; sleeping ones are dropped and
    /// picked up by recovery on the next start.
    pub async fn run(self, mut receiver: mpsc::UnboundedReceiver<Continuation>) {
        let mut in_flight = JoinSet::new();
        tracing::info!("continuation worker started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = receiver.recv() => {
                    let Some(continuation) = received else { break };
                    in_flight.spawn(deliver(
                        self.engine.clone(),
                        self.requeue.clone(),
                        self.policy,
                        self.shutdown.clone(),
                        continuation,
                    ));
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "continuation task panicked");
                    }
                }
            }
        }

        let remaining = in_flight.len();
        while in_flight.join_next().await.is_some() {}
        tracing::info!(drained = remaining, "continuation worker stopped");
    }
}

async fn deliver<R, E>(
    engine: Arc<FlowEngine<R, E>>,
    requeue: ChannelScheduler,
    policy: RedeliveryPolicy,
    shutdown: CancellationToken,
    continuation: Continuation,
) where
    R: FlowRepository,
    E: EntityRepository,
{
    if !continuation.delay.is_zero() {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(continuation.delay) => {}
        }
    }

    let error = match engine.advance(AdvanceRequest::from(continuation.clone())).await {
        Ok(_) => return,
        Err(e) => e,
    };

    if error.is_retryable() && policy.should_redeliver(continuation.delivery) {
        let next = continuation.redelivery(policy.backoff(continuation.delivery));
        tracing::warn!(
            execution_id = %continuation.execution_id,
            node_id = continuation.node_id.as_str(),
            delivery = continuation.delivery,
            backoff_ms = next.delay.as_millis() as u64,
            error = %error,
            "advance failed, scheduling retry"
        );
        if requeue.schedule(next).is_err() {
            tracing::warn!(
                execution_id = %continuation.execution_id,
                "continuation queue closed, retry dropped"
            );
        }
    } else {
        tracing::error!(
            execution_id = %continuation.execution_id,
            node_id = continuation.node_id.as_str(),
            delivery = continuation.delivery,
            error = %error,
            "advance failed, giving up on continuation"
        );
    }
}
