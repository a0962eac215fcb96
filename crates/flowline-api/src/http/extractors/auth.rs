//! Internal token authentication extractor.
//!
//! Extracts and verifies the internal token from:
//! - `Authorization: Bearer <token>` header
//! - `X-Internal-Token: <token>` header
//!
//! The token is SHA-256 hashed and compared against the hash of the token
//! configured through `FLOWLINE_INTERNAL_TOKEN`. Without a configured token
//! every internal request is rejected.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use sha2::{Digest, Sha256};

use crate::http::error::AppError;
use crate::state::AppState;

/// Environment variable holding the internal trigger token.
pub const INTERNAL_TOKEN_ENV: &str = "FLOWLINE_INTERNAL_TOKEN";

/// Authenticated request marker. Extracting this validates the token.
pub struct InternalAuth;

impl FromRequestParts<AppState> for InternalAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.internal_token_hash.as_deref() else {
            return Err(AppError::Unauthorized(format!(
                "Internal API disabled: set {INTERNAL_TOKEN_ENV} to enable it."
            )));
        };

        let token = extract_token(parts)?;
        if hash_token(&token) == expected {
            Ok(InternalAuth)
        } else {
            tracing::warn!("rejected internal request with invalid token");
            Err(AppError::Unauthorized("Invalid internal token.".to_string()))
        }
    }
}

/// Extract the token from request headers.
fn extract_token(parts: &Parts) -> Result<String, AppError> {
    if let Some(auth) = parts.headers.get("authorization") {
        let auth_str = auth.to_str().map_err(|_| {
            AppError::Unauthorized("Invalid Authorization header encoding".to_string())
        })?;
        if let Some(token) = auth_str.strip_prefix("Bearer ") {
            return Ok(token.trim().to_string());
        }
    }

    if let Some(token) = parts.headers.get("x-internal-token") {
        let token_str = token.to_str().map_err(|_| {
            AppError::Unauthorized("Invalid X-Internal-Token header encoding".to_string())
        })?;
        return Ok(token_str.trim().to_string());
    }

    Err(AppError::Unauthorized(
        "Missing token. Provide via 'Authorization: Bearer <token>' or 'X-Internal-Token: <token>' header.".to_string(),
    ))
}

/// Compute SHA-256 hash of a token (lowercase hex).
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("{:x}", digest)
}
