//! Target entity repository trait definition.

use flowline_types::entity::TargetEntity;
use flowline_types::error::RepositoryError;
use uuid::Uuid;

/// Storage interface for the business records executions run against.
///
/// The engine never creates or deletes entities during a run. It only reads
/// them and applies scoped field patches, so concurrent executions touching
/// the same record never overwrite each other's fields.
pub trait EntityRepository: Send + Sync {
    /// Insert or replace an entity.
    fn save_entity(
        &self,
        entity: &TargetEntity,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an entity, scoped to its workspace.
    fn get_entity(
        &self,
        workspace_id: &Uuid,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<TargetEntity>, RepositoryError>> + Send;

    /// Merge `patch` into the entity's fields (top-level keys only).
    ///
    /// Returns `false` when no entity matched in the workspace.
    fn patch_fields(
        &self,
        workspace_id: &Uuid,
        id: &Uuid,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
