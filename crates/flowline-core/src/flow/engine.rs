//! Flow engine: one `advance` cycle per (execution, node) continuation.
//!
//! A cycle loads the execution, flow and target entity, fences duplicate
//! deliveries through the node log, dispatches the node, merges its output
//! into the execution context, and schedules every matching successor.
//! The execution completes when no branch is left pending.

use std::sync::Arc;
use std::time::{Duration, Instant};

use flowline_types::config::EngineConfig;
use flowline_types::event::FlowEvent;
use flowline_types::execution::{
    Execution, ExecutionContext, ExecutionStatus, LAST_NODE_KEY, NodeExecution,
};
use flowline_types::flow::{FlowDefinition, NodeDefinition};
use serde::Serialize;
use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

use super::context::{self, ContextPatch, failure_output};
use super::definition::{FlowError, validate_flow};
use super::dispatcher::{DispatchInput, DispatchResult, NodeDispatcher};
use super::expression::{ExecutionRef, build_scope};
use super::graph;
use super::handler::AiStepHandler;
use super::log::{BeginOutcome, NodeLog};
use super::scheduler::{Continuation, ContinuationScheduler, SchedulerError};
use super::store::{ExecutionStore, StoreError};
use crate::event::EventBus;
use crate::repository::entity::EntityRepository;
use crate::repository::flow::FlowRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("flow not found: {0}")]
    FlowNotFound(Uuid),

    #[error("node '{node_id}' not found in flow for execution {execution_id}")]
    NodeNotFound { execution_id: Uuid, node_id: String },

    #[error("target entity not found: {0}")]
    EntityNotFound(Uuid),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    InvalidFlow(#[from] FlowError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ExecutionNotFound(id) => EngineError::ExecutionNotFound(id),
            other => EngineError::Store(other),
        }
    }
}

impl From<flowline_types::error::RepositoryError> for EngineError {
    fn from(e: flowline_types::error::RepositoryError) -> Self {
        EngineError::Store(StoreError::Repository(e))
    }
}

impl EngineError {
    /// Whether the trigger caller should redeliver the same continuation.
    ///
    /// Resolution failures are fatal; persistence and scheduling failures
    /// leave the execution running and are retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_retryable(),
            EngineError::Scheduler(_) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Request / outcome types
// ---------------------------------------------------------------------------

/// "Run node N of execution E".
#[derive(Debug, Clone, PartialEq)]
pub struct AdvanceRequest {
    pub execution_id: Uuid,
    pub node_id: String,
    /// Extra context visible to this dispatch only.
    pub context: ExecutionContext,
    /// Set on redelivery after a retryable failure.
    pub is_retry: bool,
}

impl From<Continuation> for AdvanceRequest {
    fn from(c: Continuation) -> Self {
        Self {
            execution_id: c.execution_id,
            node_id: c.node_id,
            context: c.context,
            is_retry: c.is_retry,
        }
    }
}

/// What one `advance` cycle did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// The node finished (or its recorded result was merged) and successors
    /// were scheduled.
    Advanced {
        node_id: String,
        success: bool,
        /// The result came from the node log instead of a new dispatch.
        resumed: bool,
        scheduled: Vec<String>,
        status: ExecutionStatus,
    },
    /// The node's result is already merged; nothing was dispatched.
    Duplicate {
        node_id: String,
        rescheduled: Vec<String>,
    },
    /// Another delivery currently owns this node.
    InFlight { node_id: String },
    /// The execution is already terminal.
    ExecutionFinished { status: ExecutionStatus },
}

/// Parameters for starting a flow against a target entity.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub flow_id: Uuid,
    pub target_entity_id: Uuid,
    pub workspace_id: Uuid,
    pub context: ExecutionContext,
}

/// Result of a recovery sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub executions_scanned: usize,
    pub continuations_scheduled: usize,
    pub errors: Vec<String>,
}

/// Runtime knobs derived from `EngineConfig`.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub pacing_delay: Duration,
    pub max_store_retries: u32,
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            pacing_delay: Duration::from_millis(config.pacing_delay_ms),
            max_store_retries: config.max_store_retries,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// FlowEngine
// ---------------------------------------------------------------------------

/// Drives executions through their flows.
///
/// Generic over the storage backends so tests can run it against the
/// in-memory repositories.
pub struct FlowEngine<R: FlowRepository, E: EntityRepository> {
    repo: Arc<R>,
    entities: Arc<E>,
    store: ExecutionStore<R>,
    log: NodeLog<R>,
    dispatcher: NodeDispatcher<E>,
    scheduler: Arc<dyn ContinuationScheduler>,
    event_bus: EventBus,
    settings: EngineSettings,
}

impl<R: FlowRepository, E: EntityRepository> FlowEngine<R, E> {
    pub fn new(
        repo: Arc<R>,
        entities: Arc<E>,
        ai_handler: Arc<dyn AiStepHandler>,
        scheduler: Arc<dyn ContinuationScheduler>,
        event_bus: EventBus,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store: ExecutionStore::new(repo.clone(), settings.max_store_retries),
            log: NodeLog::new(repo.clone()),
            dispatcher: NodeDispatcher::new(entities.clone(), ai_handler),
            repo,
            entities,
            scheduler,
            event_bus,
            settings,
        }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn entities(&self) -> &E {
        &self.entities
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    // -----------------------------------------------------------------------
    // Flows and queries
    // -----------------------------------------------------------------------

    /// Validate and persist a flow.
    pub async fn register_flow(&self, flow: &FlowDefinition) -> Result<(), EngineError> {
        validate_flow(flow)?;
        for orphan in graph::unreachable_nodes(flow) {
            tracing::warn!(flow = %flow.name, node_id = orphan, "node is unreachable from the entry node");
        }
        self.repo.save_flow(flow).await?;
        tracing::info!(flow_id = %flow.id, flow = %flow.name, nodes = flow.nodes.len(), "flow registered");
        Ok(())
    }

    pub async fn execution(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        Ok(self.store.load(execution_id).await?)
    }

    pub async fn node_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecution>, EngineError> {
        Ok(self.log.entries(execution_id).await?)
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Create an execution for `request` and schedule its entry node.
    pub async fn start_execution(&self, request: StartRequest) -> Result<Execution, EngineError> {
        let flow = self
            .repo
            .get_flow(&request.flow_id)
            .await?
            .filter(|f| f.workspace_id == request.workspace_id)
            .ok_or(EngineError::FlowNotFound(request.flow_id))?;

        self.entities
            .get_entity(&request.workspace_id, &request.target_entity_id)
            .await?
            .ok_or(EngineError::EntityNotFound(request.target_entity_id))?;

        if let Some(key) = request
            .context
            .keys()
            .find(|k| k.as_str() == LAST_NODE_KEY || flow.node(k).is_some())
        {
            return Err(EngineError::InvalidRequest(format!(
                "initial context key '{key}' is reserved for node output"
            )));
        }

        let entry = graph::entry_node(&flow)
            .ok_or_else(|| EngineError::InvalidRequest("flow has no nodes".to_string()))?;

        let mut execution = Execution::new(
            flow.id,
            request.target_entity_id,
            request.workspace_id,
            request.context,
        );
        execution.current_node_id = Some(entry.id.clone());
        self.store.create(&execution).await?;

        tracing::info!(
            execution_id = %execution.id,
            flow = %flow.name,
            target_entity_id = %execution.target_entity_id,
            entry = entry.id.as_str(),
            "execution started"
        );
        self.event_bus.publish(FlowEvent::ExecutionStarted {
            execution_id: execution.id,
            flow_id: flow.id,
            target_entity_id: execution.target_entity_id,
        });

        self.scheduler
            .schedule(Continuation::new(execution.id, &entry.id, Duration::ZERO))?;
        Ok(execution)
    }

    // -----------------------------------------------------------------------
    // Advance
    // -----------------------------------------------------------------------

    /// Run one continuation cycle. Safe to call more than once for the same
    /// `(execution, node)`.
    pub async fn advance(&self, request: AdvanceRequest) -> Result<AdvanceOutcome, EngineError> {
        let span = tracing::info_span!(
            "flow.advance",
            execution_id = %request.execution_id,
            node_id = request.node_id.as_str(),
            is_retry = request.is_retry,
        );
        self.advance_inner(request).instrument(span).await
    }

    async fn advance_inner(&self, request: AdvanceRequest) -> Result<AdvanceOutcome, EngineError> {
        let execution = self.store.load(request.execution_id).await?;
        if execution.status.is_terminal() {
            tracing::debug!(status = %execution.status, "execution already finished");
            return Ok(AdvanceOutcome::ExecutionFinished {
                status: execution.status,
            });
        }

        let Some(flow) = self.repo.get_flow(&execution.flow_id).await? else {
            self.fail_execution(execution.id, format!("flow {} not found", execution.flow_id))
                .await?;
            return Err(EngineError::FlowNotFound(execution.flow_id));
        };

        let Some(node) = flow.node(&request.node_id).cloned() else {
            self.fail_execution(
                execution.id,
                format!("node '{}' not found in flow '{}'", request.node_id, flow.name),
            )
            .await?;
            return Err(EngineError::NodeNotFound {
                execution_id: execution.id,
                node_id: request.node_id,
            });
        };

        if execution.context.contains_key(&node.id) {
            let rescheduled = if request.is_retry {
                self.reschedule_unstarted(&flow, &execution, &node).await?
            } else {
                Vec::new()
            };
            tracing::debug!(rescheduled = rescheduled.len(), "node already merged, skipping");
            self.event_bus.publish(FlowEvent::NodeSkipped {
                execution_id: execution.id,
                node_id: node.id.clone(),
                reason: "already completed".to_string(),
            });
            return Ok(AdvanceOutcome::Duplicate {
                node_id: node.id,
                rescheduled,
            });
        }

        let Some(entity) = self
            .entities
            .get_entity(&execution.workspace_id, &execution.target_entity_id)
            .await?
        else {
            self.fail_execution(
                execution.id,
                format!("target entity {} not found", execution.target_entity_id),
            )
            .await?;
            return Err(EngineError::EntityNotFound(execution.target_entity_id));
        };

        let exec_ref = ExecutionRef {
            execution_id: execution.id,
            workspace_id: execution.workspace_id,
            target_entity_id: execution.target_entity_id,
        };
        let snapshot = context::snapshot(&execution.context, &request.context);
        let scope = build_scope(exec_ref, &entity, &snapshot);
        let input = Value::Object(snapshot);
        let dispatch = |entry: NodeExecution| {
            let flow = &flow;
            let node = &node;
            let scope = &scope;
            async move {
                let input = DispatchInput {
                    node,
                    execution: exec_ref,
                    scope,
                    persona: flow.agent_persona.as_deref(),
                };
                self.run_node(&entry, input).await
            }
        };

        let (result, resumed) = match self
            .log
            .begin(execution.id, &node, &input, request.is_retry)
            .await?
        {
            BeginOutcome::Started(entry) => (dispatch(entry).await?, false),
            BeginOutcome::Existing(existing) if existing.status.is_terminal() => {
                tracing::info!(attempt = existing.attempt, "resuming from recorded node result");
                (recorded_result(&existing), true)
            }
            BeginOutcome::Existing(existing) if !request.is_retry => {
                tracing::debug!(attempt = existing.attempt, "node already in flight");
                self.event_bus.publish(FlowEvent::NodeSkipped {
                    execution_id: execution.id,
                    node_id: node.id.clone(),
                    reason: "in flight".to_string(),
                });
                return Ok(AdvanceOutcome::InFlight { node_id: node.id.clone() });
            }
            BeginOutcome::Existing(stale) => {
                tracing::warn!(attempt = stale.attempt, "superseding stale running node entry");
                self.log.supersede(&stale).await?;
                match self.log.begin(execution.id, &node, &input, true).await? {
                    BeginOutcome::Started(entry) => (dispatch(entry).await?, false),
                    BeginOutcome::Existing(other) if other.status.is_terminal() => {
                        (recorded_result(&other), true)
                    }
                    BeginOutcome::Existing(_) => {
                        return Ok(AdvanceOutcome::InFlight { node_id: node.id.clone() });
                    }
                }
            }
        };

        self.merge_and_continue(&flow, &node, execution.id, result, resumed)
            .await
    }

    /// Dispatch a claimed node and finalize its log entry.
    async fn run_node(
        &self,
        entry: &NodeExecution,
        input: DispatchInput<'_>,
    ) -> Result<DispatchResult, EngineError> {
        self.event_bus.publish(FlowEvent::NodeStarted {
            execution_id: entry.execution_id,
            node_id: entry.node_id.clone(),
            node_type: entry.node_type.clone(),
            attempt: entry.attempt,
        });

        let started = Instant::now();
        let result = self.dispatcher.dispatch(input).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        self.log
            .finish(entry.id, result.success, &result.output, result.error.as_deref())
            .await?;

        if result.success {
            tracing::info!(
                node_type = entry.node_type.as_str(),
                attempt = entry.attempt,
                duration_ms,
                "node completed"
            );
            self.event_bus.publish(FlowEvent::NodeCompleted {
                execution_id: entry.execution_id,
                node_id: entry.node_id.clone(),
                duration_ms,
            });
        } else {
            let error = result.error.clone().unwrap_or_default();
            tracing::warn!(
                node_type = entry.node_type.as_str(),
                attempt = entry.attempt,
                error = error.as_str(),
                "node failed, continuing traversal"
            );
            self.event_bus.publish(FlowEvent::NodeFailed {
                execution_id: entry.execution_id,
                node_id: entry.node_id.clone(),
                error,
            });
        }

        Ok(result)
    }

    /// Merge a node result, settle the execution status, and schedule the
    /// selected successors.
    async fn merge_and_continue(
        &self,
        flow: &FlowDefinition,
        node: &NodeDefinition,
        execution_id: Uuid,
        result: DispatchResult,
        resumed: bool,
    ) -> Result<AdvanceOutcome, EngineError> {
        let next = graph::next_nodes(flow, node, &result.output);
        let patch = ContextPatch::node_finished(&node.id, result.output.clone());

        let update = self
            .store
            .update_with(execution_id, |current| {
                let mut merged = patch.apply(current);
                let status = graph::settled_status(flow, merged.status, &merged.context);
                context::transition(&mut merged, status);
                merged
            })
            .await?;

        if update.entered(ExecutionStatus::Completed) {
            tracing::info!("execution completed");
            self.event_bus
                .publish(FlowEvent::ExecutionCompleted { execution_id });
        }

        let mut scheduled = Vec::new();
        if !update.execution.status.is_terminal() {
            for target in next {
                if update.execution.context.contains_key(target) {
                    continue;
                }
                self.scheduler.schedule(Continuation::new(
                    execution_id,
                    target,
                    self.settings.pacing_delay,
                ))?;
                scheduled.push(target.to_string());
            }
        }

        tracing::debug!(
            success = result.success,
            resumed,
            scheduled = ?scheduled,
            status = %update.execution.status,
            "node merged"
        );

        Ok(AdvanceOutcome::Advanced {
            node_id: node.id.clone(),
            success: result.success,
            resumed,
            scheduled,
            status: update.execution.status,
        })
    }

    /// Re-issue continuations for successors of a merged node that never
    /// started (lost after a crash or a failed enqueue).
    async fn reschedule_unstarted(
        &self,
        flow: &FlowDefinition,
        execution: &Execution,
        node: &NodeDefinition,
    ) -> Result<Vec<String>, EngineError> {
        let Some(output) = execution.context.get(&node.id) else {
            return Ok(Vec::new());
        };
        let mut rescheduled = Vec::new();
        for target in graph::next_nodes(flow, node, output) {
            if execution.context.contains_key(target)
                || self.log.latest(execution.id, target).await?.is_some()
            {
                continue;
            }
            self.scheduler.schedule(Continuation::new(
                execution.id,
                target,
                self.settings.pacing_delay,
            ))?;
            rescheduled.push(target.to_string());
        }
        Ok(rescheduled)
    }

    /// Mark an execution failed. A record that is already terminal is left
    /// as is.
    pub async fn fail_execution(
        &self,
        execution_id: Uuid,
        error: String,
    ) -> Result<(), EngineError> {
        let update = self
            .store
            .update(execution_id, &ContextPatch::fail(error.clone()))
            .await?;
        if update.entered(ExecutionStatus::Failed) {
            tracing::error!(execution_id = %execution_id, error = error.as_str(), "execution failed");
            self.event_bus
                .publish(FlowEvent::ExecutionFailed { execution_id, error });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Reschedule every pending node of a running execution.
    ///
    /// Nodes with a stale `running` entry are rescheduled as retries, so
    /// this must only run when no other worker is advancing the execution
    /// (e.g. at startup).
    pub async fn recover(&self, execution_id: Uuid) -> Result<Vec<String>, EngineError> {
        let execution = self.store.load(execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(Vec::new());
        }
        let Some(flow) = self.repo.get_flow(&execution.flow_id).await? else {
            self.fail_execution(execution_id, format!("flow {} not found", execution.flow_id))
                .await?;
            return Err(EngineError::FlowNotFound(execution.flow_id));
        };

        let started = flow.nodes.iter().any(|n| execution.context.contains_key(&n.id));
        let frontier = if started {
            graph::pending_frontier(&flow, &execution.context)
        } else {
            graph::entry_node(&flow)
                .map(|n| vec![n.id.clone()])
                .unwrap_or_default()
        };

        if started && frontier.is_empty() {
            // Every branch ended but the completion write never landed.
            let update = self
                .store
                .update_with(execution_id, |current| {
                    let mut next = current.clone();
                    let status = graph::settled_status(&flow, next.status, &next.context);
                    context::transition(&mut next, status);
                    next
                })
                .await?;
            if update.entered(ExecutionStatus::Completed) {
                self.event_bus
                    .publish(FlowEvent::ExecutionCompleted { execution_id });
            }
            return Ok(Vec::new());
        }

        for node_id in &frontier {
            let stale = self
                .log
                .latest(execution_id, node_id)
                .await?
                .is_some_and(|e| !e.status.is_terminal());
            let mut continuation = Continuation::new(execution_id, node_id, Duration::ZERO);
            continuation.is_retry = stale;
            self.scheduler.schedule(continuation)?;
        }

        tracing::info!(
            execution_id = %execution_id,
            rescheduled = ?frontier,
            "execution recovered"
        );
        Ok(frontier)
    }

    /// Recover every running execution. Failures are collected per
    /// execution rather than aborting the sweep.
    pub async fn recover_all(&self) -> Result<RecoveryReport, EngineError> {
        let running = self
            .repo
            .list_executions_by_status(ExecutionStatus::Running)
            .await?;

        let mut report = RecoveryReport {
            executions_scanned: running.len(),
            ..Default::default()
        };
        for execution in running {
            match self.recover(execution.id).await {
                Ok(scheduled) => report.continuations_scheduled += scheduled.len(),
                Err(e) => {
                    tracing::warn!(execution_id = %execution.id, error = %e, "recovery failed");
                    report.errors.push(format!("{}: {e}", execution.id));
                }
            }
        }
        Ok(report)
    }
}

/// Rebuild a dispatch result from a finalized log entry.
fn recorded_result(entry: &NodeExecution) -> DispatchResult {
    let success = entry.status == flowline_types::execution::NodeExecutionStatus::Completed;
    let error = entry.error_message.clone();
    let output = match (&entry.output_data, success) {
        (Some(output), _) if !output.is_null() => output.clone(),
        (_, true) => Value::Object(serde_json::Map::new()),
        (_, false) => failure_output(error.as_deref().unwrap_or("node failed")),
    };
    DispatchResult {
        success,
        output,
        error,
    }
}
