//! Node dispatcher.
//!
//! Given a node and an immutable scope (context snapshot, entity fields,
//! execution IDs), produce a `DispatchResult`. Dispatch never fails past
//! this boundary: handler errors, bad configs and panics all become
//! `success = false` results.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use flowline_types::error::RepositoryError;
use flowline_types::flow::NodeDefinition;
use futures_util::FutureExt;
use serde_json::{Value, json};

use super::context::failure_output;
use super::definition::FlowError;
use super::expression::{ExecutionRef, ExpressionError, FlowEvaluator};
use super::handler::{AiStepHandler, AiStepRequest, HandlerError};
use super::node::{AiStepConfig, ConditionConfig, NodeKind, UpdateStatusConfig};
use super::prompt;
use crate::repository::entity::EntityRepository;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Outcome of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    pub success: bool,
    /// Payload merged into the context under the node ID. May carry a
    /// `branch` selector.
    pub output: Value,
    pub error: Option<String>,
}

impl DispatchResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            output: failure_output(&error),
            error: Some(error),
        }
    }
}

/// Everything a dispatch may read.
#[derive(Debug, Clone, Copy)]
pub struct DispatchInput<'a> {
    pub node: &'a NodeDefinition,
    pub execution: ExecutionRef,
    /// Scope built by `expression::build_scope`.
    pub scope: &'a Value,
    /// Flow-level default system instruction.
    pub persona: Option<&'a str>,
}

#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error(transparent)]
    Config(#[from] FlowError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("condition evaluation failed: {0}")]
    Expression(#[from] ExpressionError),

    #[error("entity update failed: {0}")]
    Entity(#[from] RepositoryError),

    #[error("target entity {0} not found in workspace")]
    EntityMissing(uuid::Uuid),
}

// ---------------------------------------------------------------------------
// NodeDispatcher
// ---------------------------------------------------------------------------

pub struct NodeDispatcher<E: EntityRepository> {
    entities: Arc<E>,
    ai_handler: Arc<dyn AiStepHandler>,
    evaluator: FlowEvaluator,
}

impl<E: EntityRepository> NodeDispatcher<E> {
    pub fn new(entities: Arc<E>, ai_handler: Arc<dyn AiStepHandler>) -> Self {
        Self {
            entities,
            ai_handler,
            evaluator: FlowEvaluator::new(),
        }
    }

    /// Run one node. Never returns an error and never panics.
    pub async fn dispatch(&self, input: DispatchInput<'_>) -> DispatchResult {
        let outcome = AssertUnwindSafe(self.dispatch_inner(input))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(
                    execution_id = %input.execution.execution_id,
                    node_id = input.node.id.as_str(),
                    node_type = input.node.node_type.as_str(),
                    error = %e,
                    "node dispatch failed"
                );
                DispatchResult::failed(e.to_string())
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(
                    execution_id = %input.execution.execution_id,
                    node_id = input.node.id.as_str(),
                    panic = message.as_str(),
                    "node handler panicked"
                );
                DispatchResult::failed(format!("handler panicked: {message}"))
            }
        }
    }

    async fn dispatch_inner(&self, input: DispatchInput<'_>) -> Result<DispatchResult, DispatchError> {
        match NodeKind::parse(input.node)? {
            NodeKind::AiStep(config) => self.run_ai_step(&input, &config).await,
            NodeKind::Condition(config) => self.run_condition(&input, &config),
            NodeKind::UpdateStatus(config) => self.run_update_status(&input, &config).await,
            NodeKind::End => Ok(DispatchResult::ok(json!({ "completed": true }))),
            NodeKind::Unknown { node_type } => {
                tracing::warn!(
                    node_id = input.node.id.as_str(),
                    node_type = node_type.as_str(),
                    "unknown node type, passing through"
                );
                Ok(DispatchResult::ok(json!({ "pass_through": true })))
            }
        }
    }

    async fn run_ai_step(
        &self,
        input: &DispatchInput<'_>,
        config: &AiStepConfig,
    ) -> Result<DispatchResult, DispatchError> {
        let request = AiStepRequest {
            system_prompt: prompt::system_prompt(config, input.persona, input.scope),
            messages: prompt::build_messages(config, input.scope),
            node_type: input.node.node_type.clone(),
            action: config.action.as_str().to_string(),
            channel: config.channel.clone(),
            model: config.model.clone(),
            target_entity_id: input.execution.target_entity_id,
            execution_id: input.execution.execution_id,
            workspace_id: input.execution.workspace_id,
        };

        let response = self.ai_handler.invoke(request).await?;
        let mut output = match response.output {
            Value::Object(_) => response.output,
            Value::Null => json!({}),
            other => json!({ "result": other }),
        };
        if response.success {
            return Ok(DispatchResult::ok(output));
        }

        // Reported failures keep the handler's payload, branch included.
        let error = response
            .error
            .unwrap_or_else(|| "handler reported failure".to_string());
        tracing::warn!(
            execution_id = %input.execution.execution_id,
            node_id = input.node.id.as_str(),
            error = error.as_str(),
            "ai step handler reported failure"
        );
        if let Value::Object(fields) = &mut output {
            fields.insert("success".to_string(), Value::Bool(false));
            fields.insert("error".to_string(), Value::String(error.clone()));
        }
        Ok(DispatchResult {
            success: false,
            output,
            error: Some(error),
        })
    }

    fn run_condition(
        &self,
        input: &DispatchInput<'_>,
        config: &ConditionConfig,
    ) -> Result<DispatchResult, DispatchError> {
        let output = match config {
            ConditionConfig::Binary {
                expression,
                true_branch,
                false_branch,
            } => {
                let result = self.evaluator.evaluate_bool(expression, input.scope)?;
                let branch = if result { true_branch } else { false_branch };
                json!({ "branch": branch, "result": result })
            }
            ConditionConfig::Cases {
                cases,
                default_branch,
            } => {
                let mut selected = None;
                for (index, case) in cases.iter().enumerate() {
                    if self.evaluator.evaluate_bool(&case.when, input.scope)? {
                        selected = Some((index, case.branch.as_str()));
                        break;
                    }
                }
                match (selected, default_branch) {
                    (Some((index, branch)), _) => json!({ "branch": branch, "matched": index }),
                    (None, Some(default)) => json!({ "branch": default, "matched": null }),
                    (None, None) => json!({ "matched": null }),
                }
            }
        };
        Ok(DispatchResult::ok(output))
    }

    async fn run_update_status(
        &self,
        input: &DispatchInput<'_>,
        config: &UpdateStatusConfig,
    ) -> Result<DispatchResult, DispatchError> {
        let patch = config.patch();
        let applied = self
            .entities
            .patch_fields(
                &input.execution.workspace_id,
                &input.execution.target_entity_id,
                &patch,
            )
            .await?;
        if !applied {
            return Err(DispatchError::EntityMissing(input.execution.target_entity_id));
        }
        Ok(DispatchResult::ok(json!({ "updated": true, "fields": patch })))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use chrono::Utc;
    use flowline_types::entity::TargetEntity;
    use flowline_types::execution::ExecutionContext;
    use uuid::Uuid;

    use crate::flow::expression::build_scope;
    use crate::flow::handler::AiStepResponse;
    use crate::repository::memory::InMemoryEntityRepository;

    enum Reply {
        Respond(AiStepResponse),
        Fail,
        Panic,
    }

    struct StubHandler {
        reply: Reply,
        seen: Mutex<Vec<AiStepRequest>>,
    }

    impl AiStepHandler for StubHandler {
        fn invoke(
            &self,
            request: AiStepRequest,
        ) -> Pin<Box<dyn Future<Output = Result<AiStepResponse, HandlerError>> + Send + '_>>
        {
            self.seen.lock().unwrap().push(request);
            Box::pin(async move {
                match &self.reply {
                    Reply::Respond(r) => Ok(r.clone()),
                    Reply::Fail => Err(HandlerError::Transport("connection refused".to_string())),
                    Reply::Panic => panic!("handler exploded"),
                }
            })
        }
    }

    struct Fixture {
        entities: Arc<InMemoryEntityRepository>,
        handler: Arc<StubHandler>,
        dispatcher: NodeDispatcher<InMemoryEntityRepository>,
        execution: ExecutionRef,
        scope: Value,
    }

    async fn fixture(reply: Reply) -> Fixture {
        let entities = Arc::new(InMemoryEntityRepository::new());
        let entity = TargetEntity {
            id: Uuid::now_v7(),
            workspace_id: Uuid::now_v7(),
            fields: json!({"name": "Ada", "score": 85}).as_object().cloned().unwrap(),
            updated_at: Utc::now(),
        };
        entities.save_entity(&entity).await.unwrap();

        let handler = Arc::new(StubHandler {
            reply,
            seen: Mutex::new(Vec::new()),
        });
        let execution = ExecutionRef {
            execution_id: Uuid::now_v7(),
            workspace_id: entity.workspace_id,
            target_entity_id: entity.id,
        };
        let context: ExecutionContext =
            json!({"analyze": {"score": 91}}).as_object().cloned().unwrap();
        let scope = build_scope(execution, &entity, &context);

        Fixture {
            dispatcher: NodeDispatcher::new(entities.clone(), handler.clone()),
            entities,
            handler,
            execution,
            scope,
        }
    }

    fn node(node_type: &str, config: Value) -> NodeDefinition {
        NodeDefinition {
            id: "n1".to_string(),
            node_type: node_type.to_string(),
            config,
        }
    }

    async fn run(f: &Fixture, node: &NodeDefinition, persona: Option<&str>) -> DispatchResult {
        f.dispatcher
            .dispatch(DispatchInput {
                node,
                execution: f.execution,
                scope: &f.scope,
                persona,
            })
            .await
    }

    fn ok_reply(output: Value) -> Reply {
        Reply::Respond(AiStepResponse {
            success: true,
            output,
            error: None,
        })
    }

    #[tokio::test]
    async fn test_ai_step_delegates_with_persona() {
        let f = fixture(ok_reply(json!({"draft": "Hello Ada"}))).await;
        let n = node("draft_message", json!({"prompt": "Write to {{ entity.name }}"}));
        let result = run(&f, &n, Some("You are Sam from Acme.")).await;

        assert!(result.success);
        assert_eq!(result.output, json!({"draft": "Hello Ada"}));

        let seen = f.handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].system_prompt, "You are Sam from Acme.");
        assert_eq!(seen[0].messages[0].content, "Write to Ada");
        assert_eq!(seen[0].node_type, "draft_message");
        assert_eq!(seen[0].action, "draft_message");
        assert_eq!(seen[0].target_entity_id, f.execution.target_entity_id);
    }

    #[tokio::test]
    async fn test_ai_step_scalar_output_is_wrapped() {
        let f = fixture(ok_reply(json!("plain text"))).await;
        let result = run(&f, &node("research", json!({})), None).await;
        assert_eq!(result.output, json!({"result": "plain text"}));
    }

    #[tokio::test]
    async fn test_ai_step_handler_rejection_is_failure() {
        let f = fixture(Reply::Respond(AiStepResponse {
            success: false,
            output: Value::Null,
            error: Some("quota exceeded".to_string()),
        }))
        .await;
        let result = run(&f, &node("send_email", json!({})), None).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("quota exceeded"));
        assert_eq!(result.output["success"], false);
    }

    #[tokio::test]
    async fn test_ai_step_rejection_keeps_handler_output() {
        let f = fixture(Reply::Respond(AiStepResponse {
            success: false,
            output: json!({"branch": "bounced", "provider": "smtp"}),
            error: Some("mailbox full".to_string()),
        }))
        .await;
        let result = run(&f, &node("send_email", json!({})), None).await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("mailbox full"));
        assert_eq!(
            result.output,
            json!({
                "branch": "bounced",
                "provider": "smtp",
                "success": false,
                "error": "mailbox full"
            })
        );
    }

    #[tokio::test]
    async fn test_ai_step_transport_error_is_failure() {
        let f = fixture(Reply::Fail).await;
        let result = run(&f, &node("ai_analysis", json!({})), None).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let f = fixture(Reply::Panic).await;
        let result = run(&f, &node("follow_up", json!({})), None).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_condition_binary_labels() {
        let f = fixture(ok_reply(json!({}))).await;
        let hit = node(
            "condition",
            json!({"expression": "context.analyze.score > 90", "true_branch": "match"}),
        );
        let result = run(&f, &hit, None).await;
        assert_eq!(result.output, json!({"branch": "match", "result": true}));

        let miss = node("condition", json!({"expression": "entity.score > 90"}));
        assert_eq!(run(&f, &miss, None).await.output["branch"], "no");
    }

    #[tokio::test]
    async fn test_condition_cases_and_default() {
        let f = fixture(ok_reply(json!({}))).await;
        let n = node(
            "branch",
            json!({
                "cases": [
                    {"when": "entity.score > 90", "branch": "hot"},
                    {"when": "entity.score > 80", "branch": "warm"}
                ],
                "default_branch": "cold"
            }),
        );
        assert_eq!(
            run(&f, &n, None).await.output,
            json!({"branch": "warm", "matched": 1})
        );

        let none = node("branch", json!({"cases": [{"when": "false", "branch": "x"}]}));
        let result = run(&f, &none, None).await;
        assert!(result.success);
        assert!(result.output.get("branch").is_none());
    }

    #[tokio::test]
    async fn test_condition_eval_error_is_failure() {
        let f = fixture(ok_reply(json!({}))).await;
        let result = run(&f, &node("condition", json!({"expression": "entity.score >"})), None).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_update_status_patches_entity() {
        let f = fixture(ok_reply(json!({}))).await;
        let result = run(&f, &node("update_status", json!({"status": "contacted"})), None).await;
        assert!(result.success);
        assert_eq!(result.output["fields"]["status"], "contacted");

        let stored = f
            .entities
            .get_entity(&f.execution.workspace_id, &f.execution.target_entity_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.fields["status"], "contacted");
        assert_eq!(stored.fields["name"], "Ada");
        assert_eq!(f.entities.patches_applied(), 1);
    }

    #[tokio::test]
    async fn test_end_and_unknown() {
        let f = fixture(ok_reply(json!({}))).await;
        assert_eq!(
            run(&f, &node("end", json!({})), None).await,
            DispatchResult::ok(json!({"completed": true}))
        );
        assert_eq!(
            run(&f, &node("wait_days", json!({})), None).await,
            DispatchResult::ok(json!({"pass_through": true}))
        );
        assert!(f.handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_config_is_failure_not_error() {
        let f = fixture(ok_reply(json!({}))).await;
        let result = run(&f, &node("update_status", json!({})), None).await;
        assert!(!result.success);
        assert_eq!(f.entities.patches_applied(), 0);
    }
}
