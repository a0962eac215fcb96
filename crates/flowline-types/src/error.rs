use thiserror::Error;

/// Errors from repository operations (used by trait definitions in flowline-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    /// Optimistic concurrency check failed (stale version).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl RepositoryError {
    /// Whether re-running the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RepositoryError::Connection | RepositoryError::Query(_) | RepositoryError::Conflict(_)
        )
    }
}
