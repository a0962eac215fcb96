//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use flowline_core::flow::EngineError;
use flowline_core::flow::definition::FlowError;

use crate::http::response::{ApiErrorDetail, ApiResponse};

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Engine errors, classified by kind.
    Engine(EngineError),
    /// Authentication failure.
    Unauthorized(String),
    /// Request body or parameter is invalid.
    Validation(String),
    /// Generic lookup miss outside the engine.
    NotFound(String),
    /// Unexpected server-side failure outside the engine.
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl From<FlowError> for AppError {
    fn from(e: FlowError) -> Self {
        AppError::Engine(EngineError::InvalidFlow(e))
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Engine(e) => {
                let (status, code) = match e {
                    EngineError::ExecutionNotFound(_) => {
                        (StatusCode::NOT_FOUND, "EXECUTION_NOT_FOUND")
                    }
                    EngineError::FlowNotFound(_) => (StatusCode::NOT_FOUND, "FLOW_NOT_FOUND"),
                    EngineError::NodeNotFound { .. } => (StatusCode::NOT_FOUND, "NODE_NOT_FOUND"),
                    EngineError::EntityNotFound(_) => (StatusCode::NOT_FOUND, "ENTITY_NOT_FOUND"),
                    EngineError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                    EngineError::InvalidFlow(_) => (StatusCode::BAD_REQUEST, "INVALID_FLOW"),
                    e if e.is_retryable() => (StatusCode::SERVICE_UNAVAILABLE, "RETRYABLE"),
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, "ENGINE_ERROR"),
                };
                (status, code, e.to_string())
            }
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        if status.is_server_error() {
            tracing::warn!(code, error = %message, "internal request failed");
        }

        ApiResponse::error(
            status,
            ApiErrorDetail {
                code: code.to_string(),
                message,
                retryable: status == StatusCode::SERVICE_UNAVAILABLE,
            },
        )
        .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::flow::scheduler::SchedulerError;
    use uuid::Uuid;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_missing_records_map_to_404() {
        assert_eq!(
            status_of(EngineError::ExecutionNotFound(Uuid::now_v7()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(
                EngineError::NodeNotFound {
                    execution_id: Uuid::now_v7(),
                    node_id: "ghost".to_string(),
                }
                .into()
            ),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_retryable_errors_map_to_503() {
        assert_eq!(
            status_of(EngineError::Scheduler(SchedulerError::Closed).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_validation_maps_to_400() {
        assert_eq!(
            status_of(EngineError::InvalidRequest("bad key".to_string()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(FlowError::UnknownNode("Z".to_string()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(AppError::Unauthorized("no".to_string())),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_internal_maps_to_500() {
        assert_eq!(
            status_of(AppError::Internal("task panicked".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
