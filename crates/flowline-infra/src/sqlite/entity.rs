//! SQLite target entity repository.
//!
//! Fields are stored as one JSON object per entity. `patch_fields` merges
//! top-level keys inside a writer transaction so concurrent patches from
//! different executions never drop each other's fields.

use chrono::{DateTime, Utc};
use flowline_core::repository::entity::EntityRepository;
use flowline_types::entity::TargetEntity;
use flowline_types::error::RepositoryError;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

pub struct SqliteEntityRepository {
    pool: DatabasePool,
}

impl SqliteEntityRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_fields(raw: &str) -> Result<serde_json::Map<String, serde_json::Value>, RepositoryError> {
    serde_json::from_str(raw)
        .map_err(|e| RepositoryError::Query(format!("invalid entity fields JSON: {e}")))
}

fn to_entity(row: &sqlx::sqlite::SqliteRow) -> Result<TargetEntity, RepositoryError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let workspace_id: String = row.try_get("workspace_id").map_err(db_err)?;
    let fields: String = row.try_get("fields").map_err(db_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(db_err)?;

    Ok(TargetEntity {
        id: id
            .parse()
            .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))?,
        workspace_id: workspace_id
            .parse()
            .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))?,
        fields: parse_fields(&fields)?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))?,
    })
}

impl EntityRepository for SqliteEntityRepository {
    async fn save_entity(&self, entity: &TargetEntity) -> Result<(), RepositoryError> {
        let fields = serde_json::to_string(&entity.fields)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO target_entities (id, workspace_id, fields, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 workspace_id = excluded.workspace_id,
                 fields = excluded.fields,
                 updated_at = excluded.updated_at"#,
        )
        .bind(entity.id.to_string())
        .bind(entity.workspace_id.to_string())
        .bind(&fields)
        .bind(entity.updated_at.to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_entity(
        &self,
        workspace_id: &Uuid,
        id: &Uuid,
    ) -> Result<Option<TargetEntity>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM target_entities WHERE id = ? AND workspace_id = ?")
            .bind(id.to_string())
            .bind(workspace_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;

        row.as_ref().map(to_entity).transpose()
    }

    async fn patch_fields(
        &self,
        workspace_id: &Uuid,
        id: &Uuid,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT fields FROM target_entities WHERE id = ? AND workspace_id = ?")
            .bind(id.to_string())
            .bind(workspace_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(false);
        };
        let raw: String = row.try_get("fields").map_err(db_err)?;
        let mut fields = parse_fields(&raw)?;
        for (key, value) in patch {
            fields.insert(key.clone(), value.clone());
        }
        let merged = serde_json::to_string(&fields)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query("UPDATE target_entities SET fields = ?, updated_at = ? WHERE id = ?")
            .bind(&merged)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(entity_id = %id, keys = patch.len(), "entity fields patched");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_repo() -> SqliteEntityRepository {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        std::mem::forget(dir);
        SqliteEntityRepository::new(DatabasePool::new(&url).await.unwrap())
    }

    fn prospect() -> TargetEntity {
        TargetEntity {
            id: Uuid::now_v7(),
            workspace_id: Uuid::now_v7(),
            fields: json!({ "name": "Grace", "status": "new", "company": { "size": 50 } })
                .as_object()
                .cloned()
                .unwrap(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_entity_is_scoped_to_workspace() {
        let repo = test_repo().await;
        let entity = prospect();
        repo.save_entity(&entity).await.unwrap();

        let loaded = repo
            .get_entity(&entity.workspace_id, &entity.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.fields["name"], "Grace");
        assert!(repo
            .get_entity(&Uuid::now_v7(), &entity.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_patch_merges_top_level_keys_only() {
        let repo = test_repo().await;
        let entity = prospect();
        repo.save_entity(&entity).await.unwrap();

        let patch = json!({ "status": "contacted", "company": { "industry": "fintech" } });
        let applied = repo
            .patch_fields(&entity.workspace_id, &entity.id, patch.as_object().unwrap())
            .await
            .unwrap();
        assert!(applied);

        let loaded = repo
            .get_entity(&entity.workspace_id, &entity.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.fields["name"], "Grace");
        assert_eq!(loaded.fields["status"], "contacted");
        assert_eq!(loaded.fields["company"], json!({ "industry": "fintech" }));
    }

    #[tokio::test]
    async fn test_patch_in_other_workspace_is_noop() {
        let repo = test_repo().await;
        let entity = prospect();
        repo.save_entity(&entity).await.unwrap();

        let patch = json!({ "status": "hijacked" });
        let applied = repo
            .patch_fields(&Uuid::now_v7(), &entity.id, patch.as_object().unwrap())
            .await
            .unwrap();
        assert!(!applied);

        let loaded = repo
            .get_entity(&entity.workspace_id, &entity.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.fields["status"], "new");
    }
}
