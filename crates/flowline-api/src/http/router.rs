//! Axum router configuration with middleware.
//!
//! Trigger and service routes live under `/internal/v1/` and require the
//! internal token. Middleware: tracing.

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the internal API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let internal_routes = Router::new()
        .merge(handlers::advance::advance_routes())
        .merge(handlers::execution::execution_routes())
        .merge(handlers::flow::flow_routes());

    Router::new()
        .nest("/internal/v1", internal_routes)
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint (no auth required).
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
