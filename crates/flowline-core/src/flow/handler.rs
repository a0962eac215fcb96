//! AI-step handler port.
//!
//! Every AI-flavoured node (analysis, drafting, messaging, research,
//! follow-ups) is delegated to one external handler service through this
//! trait. The infrastructure layer provides the HTTP implementation.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One chat message sent to the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Request body for one AI step invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiStepRequest {
    pub system_prompt: String,
    pub messages: Vec<PromptMessage>,
    /// Raw node type as declared in the flow (e.g. `send_email`).
    pub node_type: String,
    /// Resolved action (`analyze`, `draft_message`, ...).
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub target_entity_id: Uuid,
    pub execution_id: Uuid,
    pub workspace_id: Uuid,
}

/// Handler verdict. `success = false` is a handler failure, not a transport
/// error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiStepResponse {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("AI step handler is not configured")]
    NotConfigured,

    #[error("handler request failed: {0}")]
    Transport(String),

    #[error("handler returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid handler response: {0}")]
    InvalidResponse(String),
}

/// The external node-type handler for AI steps.
///
/// Returns a boxed future so the engine can hold it as `Arc<dyn AiStepHandler>`.
pub trait AiStepHandler: Send + Sync {
    fn invoke(
        &self,
        request: AiStepRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AiStepResponse, HandlerError>> + Send + '_>>;
}

/// Placeholder used when no handler endpoint is configured. Every AI step
/// becomes a handler failure and traversal continues.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredAiHandler;

impl AiStepHandler for UnconfiguredAiHandler {
    fn invoke(
        &self,
        _request: AiStepRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AiStepResponse, HandlerError>> + Send + '_>> {
        Box::pin(async { Err(HandlerError::NotConfigured) })
    }
}
