//! Execution start and inspection handlers.

use std::time::Instant;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowline_core::flow::StartRequest;
use flowline_types::execution::{Execution, ExecutionContext, NodeExecution};

use crate::http::error::AppError;
use crate::http::extractors::auth::InternalAuth;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Body of `POST /internal/v1/executions`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBody {
    pub flow_id: Uuid,
    pub target_entity_id: Uuid,
    pub workspace_id: Uuid,
    #[serde(default)]
    pub context: Option<ExecutionContext>,
}

/// An execution together with its node log.
#[derive(Debug, Serialize)]
pub struct ExecutionDetail {
    pub execution: Execution,
    pub nodes: Vec<NodeExecution>,
}

pub fn execution_routes() -> Router<AppState> {
    Router::new()
        .route("/executions", post(start_execution))
        .route("/executions/{id}", get(get_execution))
}

/// POST /internal/v1/executions - Start an execution and schedule its
/// entry node.
pub async fn start_execution(
    State(state): State<AppState>,
    _auth: InternalAuth,
    Json(body): Json<StartBody>,
) -> Result<ApiResponse<Execution>, AppError> {
    let start = Instant::now();

    let execution = state
        .engine
        .start_execution(StartRequest {
            flow_id: body.flow_id,
            target_entity_id: body.target_entity_id,
            workspace_id: body.workspace_id,
            context: body.context.unwrap_or_default(),
        })
        .await?;

    let link = format!("/internal/v1/executions/{}", execution.id);
    Ok(ApiResponse::accepted(execution, start).with_link("self", &link))
}

/// GET /internal/v1/executions/{id} - Execution record plus node log.
pub async fn get_execution(
    State(state): State<AppState>,
    _auth: InternalAuth,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<ExecutionDetail>, AppError> {
    let start = Instant::now();

    let execution = state.engine.execution(id).await?;
    let nodes = state.engine.node_executions(id).await?;

    let flow_link = format!("/internal/v1/flows/{}", execution.flow_id);
    Ok(ApiResponse::success(ExecutionDetail { execution, nodes }, start)
        .with_link("self", &format!("/internal/v1/executions/{id}"))
        .with_link("flow", &flow_link))
}
