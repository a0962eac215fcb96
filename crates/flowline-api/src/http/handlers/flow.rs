//! Flow registration and lookup handlers.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use flowline_core::flow::EngineError;
use flowline_core::flow::definition::FlowDocument;
use flowline_core::repository::flow::FlowRepository;
use flowline_types::flow::FlowDefinition;

use crate::http::error::AppError;
use crate::http::extractors::auth::InternalAuth;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Query parameters for listing flows.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFlowsQuery {
    pub workspace_id: Option<Uuid>,
}

pub fn flow_routes() -> Router<AppState> {
    Router::new()
        .route("/flows", post(register_flow).get(list_flows))
        .route("/flows/{id}", get(get_flow))
}

/// POST /internal/v1/flows - Validate and register a flow.
pub async fn register_flow(
    State(state): State<AppState>,
    _auth: InternalAuth,
    Json(body): Json<FlowDocument>,
) -> Result<ApiResponse<FlowDefinition>, AppError> {
    let start = Instant::now();

    let flow = body.into_definition();
    state.engine.register_flow(&flow).await?;

    let link = format!("/internal/v1/flows/{}", flow.id);
    Ok(ApiResponse::success(flow, start).with_link("self", &link))
}

/// GET /internal/v1/flows - List flows, optionally by workspace.
pub async fn list_flows(
    State(state): State<AppState>,
    _auth: InternalAuth,
    Query(query): Query<ListFlowsQuery>,
) -> Result<ApiResponse<Vec<FlowDefinition>>, AppError> {
    let start = Instant::now();

    let flows = state
        .engine
        .repo()
        .list_flows(query.workspace_id.as_ref())
        .await
        .map_err(EngineError::from)?;

    Ok(ApiResponse::success(flows, start).with_link("self", "/internal/v1/flows"))
}

/// GET /internal/v1/flows/{id} - Fetch one flow.
pub async fn get_flow(
    State(state): State<AppState>,
    _auth: InternalAuth,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<FlowDefinition>, AppError> {
    let start = Instant::now();

    let flow = state
        .engine
        .repo()
        .get_flow(&id)
        .await
        .map_err(EngineError::from)?
        .ok_or_else(|| AppError::NotFound(format!("flow not found: {id}")))?;

    Ok(ApiResponse::success(flow, start).with_link("self", &format!("/internal/v1/flows/{id}")))
}
