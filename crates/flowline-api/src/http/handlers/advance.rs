//! Trigger endpoint: run one `advance` cycle for a continuation.
//!
//! The caller (the scheduler transport) redelivers the same body with
//! `isRetry: true` whenever this endpoint answers 503.
//!
//! The cycle runs on its own task. A caller that disconnects mid-dispatch
//! cannot leave the claimed node `running`.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use flowline_core::flow::{AdvanceOutcome, AdvanceRequest};
use flowline_types::execution::ExecutionContext;

use crate::http::error::AppError;
use crate::http::extractors::auth::InternalAuth;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Body of `POST /internal/v1/advance`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceBody {
    pub execution_id: Uuid,
    pub node_id: String,
    #[serde(default)]
    pub context: Option<ExecutionContext>,
    #[serde(default)]
    pub is_retry: bool,
}

impl AdvanceBody {
    fn into_request(self) -> Result<AdvanceRequest, AppError> {
        if self.node_id.trim().is_empty() {
            return Err(AppError::Validation("nodeId must not be empty".to_string()));
        }
        Ok(AdvanceRequest {
            execution_id: self.execution_id,
            node_id: self.node_id,
            context: self.context.unwrap_or_default(),
            is_retry: self.is_retry,
        })
    }
}

pub fn advance_routes() -> Router<AppState> {
    Router::new().route("/advance", post(advance))
}

/// POST /internal/v1/advance - Perform one cycle for (execution, node).
pub async fn advance(
    State(state): State<AppState>,
    _auth: InternalAuth,
    Json(body): Json<AdvanceBody>,
) -> Result<ApiResponse<AdvanceOutcome>, AppError> {
    let start = Instant::now();
    let request = body.into_request()?;
    let execution_id = request.execution_id;

    let engine = Arc::clone(&state.engine);
    let outcome = tokio::spawn(async move { engine.advance(request).await })
        .await
        .map_err(|e| AppError::Internal(format!("advance task failed: {e}")))??;

    Ok(ApiResponse::accepted(outcome, start)
        .with_link("execution", &format!("/internal/v1/executions/{execution_id}")))
}
