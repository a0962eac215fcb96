//! SQLite flow repository implementation.
//!
//! Implements `FlowRepository` from `flowline-core`. Flow definitions are
//! stored as JSON blobs; executions carry a `version` column for optimistic
//! updates; the node log claim is a single guarded `INSERT ... SELECT`.

use chrono::{DateTime, Utc};
use flowline_core::repository::flow::{FlowRepository, NodeClaim};
use flowline_types::error::RepositoryError;
use flowline_types::execution::{
    Execution, ExecutionContext, ExecutionStatus, NodeExecution, NodeExecutionStatus,
};
use flowline_types::flow::FlowDefinition;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `FlowRepository`.
pub struct SqliteFlowRepository {
    pool: DatabasePool,
}

impl SqliteFlowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    flow_id: String,
    target_entity_id: String,
    workspace_id: String,
    current_node_id: Option<String>,
    context: String,
    status: String,
    version: i64,
    started_at: String,
    completed_at: Option<String>,
    error: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            flow_id: row.try_get("flow_id")?,
            target_entity_id: row.try_get("target_entity_id")?,
            workspace_id: row.try_get("workspace_id")?,
            current_node_id: row.try_get("current_node_id")?,
            context: row.try_get("context")?,
            status: row.try_get("status")?,
            version: row.try_get("version")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        let status: ExecutionStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let context: ExecutionContext = serde_json::from_str(&self.context)
            .map_err(|e| RepositoryError::Query(format!("invalid context JSON: {e}")))?;

        Ok(Execution {
            id: parse_uuid(&self.id)?,
            flow_id: parse_uuid(&self.flow_id)?,
            target_entity_id: parse_uuid(&self.target_entity_id)?,
            workspace_id: parse_uuid(&self.workspace_id)?,
            current_node_id: self.current_node_id,
            context,
            status,
            version: self.version,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            error: self.error,
        })
    }
}

struct NodeExecutionRow {
    id: String,
    execution_id: String,
    node_id: String,
    node_type: String,
    attempt: i64,
    status: String,
    input_data: Option<String>,
    output_data: Option<String>,
    error_message: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl NodeExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            node_id: row.try_get("node_id")?,
            node_type: row.try_get("node_type")?,
            attempt: row.try_get("attempt")?,
            status: row.try_get("status")?,
            input_data: row.try_get("input_data")?,
            output_data: row.try_get("output_data")?,
            error_message: row.try_get("error_message")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_node_execution(self) -> Result<NodeExecution, RepositoryError> {
        let status: NodeExecutionStatus = self.status.parse().map_err(RepositoryError::Query)?;

        Ok(NodeExecution {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            node_id: self.node_id,
            node_type: self.node_type,
            attempt: self.attempt as u32,
            status,
            input_data: parse_json_opt(self.input_data.as_deref(), "input_data")?,
            output_data: parse_json_opt(self.output_data.as_deref(), "output_data")?,
            error_message: self.error_message,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_json_opt(
    raw: Option<&str>,
    column: &str,
) -> Result<Option<serde_json::Value>, RepositoryError> {
    raw.map(|s| {
        serde_json::from_str(s)
            .map_err(|e| RepositoryError::Query(format!("invalid {column}: {e}")))
    })
    .transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Connection
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

/// Statuses that block a new claim: running and completed always, failed
/// unless the caller is an explicit retry.
const BLOCKING_CLAUSE: &str =
    "(status IN ('running', 'completed') OR (status = 'failed' AND ? = 0))";

// ---------------------------------------------------------------------------
// FlowRepository impl
// ---------------------------------------------------------------------------

impl FlowRepository for SqliteFlowRepository {
    async fn save_flow(&self, flow: &FlowDefinition) -> Result<(), RepositoryError> {
        let definition_json = to_json(flow)?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO flows (id, workspace_id, name, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 workspace_id = excluded.workspace_id,
                 name = excluded.name,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(flow.id.to_string())
        .bind(flow.workspace_id.to_string())
        .bind(&flow.name)
        .bind(&definition_json)
        .bind(format_datetime(&flow.created_at))
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_flow(&self, id: &Uuid) -> Result<Option<FlowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM flows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let definition: String = row.try_get("definition").map_err(query_err)?;
                let flow = serde_json::from_str(&definition).map_err(|e| {
                    RepositoryError::Query(format!("invalid flow definition JSON: {e}"))
                })?;
                Ok(Some(flow))
            }
            None => Ok(None),
        }
    }

    async fn list_flows(
        &self,
        workspace_id: Option<&Uuid>,
    ) -> Result<Vec<FlowDefinition>, RepositoryError> {
        let rows = match workspace_id {
            Some(ws) => {
                sqlx::query(
                    "SELECT definition FROM flows WHERE workspace_id = ? ORDER BY name ASC",
                )
                .bind(ws.to_string())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT definition FROM flows ORDER BY name ASC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_err)?;

        let mut flows = Vec::with_capacity(rows.len());
        for row in &rows {
            let definition: String = row.try_get("definition").map_err(query_err)?;
            flows.push(serde_json::from_str(&definition).map_err(|e| {
                RepositoryError::Query(format!("invalid flow definition JSON: {e}"))
            })?);
        }
        Ok(flows)
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO executions
               (id, flow_id, target_entity_id, workspace_id, current_node_id, context,
                status, version, started_at, completed_at, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.flow_id.to_string())
        .bind(execution.target_entity_id.to_string())
        .bind(execution.workspace_id.to_string())
        .bind(&execution.current_node_id)
        .bind(to_json(&execution.context)?)
        .bind(execution.status.as_str())
        .bind(execution.version)
        .bind(format_datetime(&execution.started_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(&execution.error)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict(
                format!("execution {} already exists", execution.id),
            ),
            other => query_err(other),
        })?;

        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => Ok(Some(
                ExecutionRow::from_row(&row)
                    .map_err(query_err)?
                    .into_execution()?,
            )),
            None => Ok(None),
        }
    }

    async fn update_execution(
        &self,
        execution: &Execution,
        expected_version: i64,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE executions SET
                 current_node_id = ?, context = ?, status = ?, version = ?,
                 completed_at = ?, error = ?
               WHERE id = ? AND version = ?"#,
        )
        .bind(&execution.current_node_id)
        .bind(to_json(&execution.context)?)
        .bind(execution.status.as_str())
        .bind(execution.version)
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(&execution.error)
        .bind(execution.id.to_string())
        .bind(expected_version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let current: Option<(i64,)> = sqlx::query_as("SELECT version FROM executions WHERE id = ?")
            .bind(execution.id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;

        match current {
            Some((version,)) => Err(RepositoryError::Conflict(format!(
                "execution {} at version {version}, expected {expected_version}",
                execution.id
            ))),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_executions_by_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM executions WHERE status = ? ORDER BY started_at ASC")
            .bind(status.as_str())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                ExecutionRow::from_row(row)
                    .map_err(query_err)?
                    .into_execution()
            })
            .collect()
    }

    async fn list_executions(
        &self,
        flow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE flow_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(flow_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                ExecutionRow::from_row(row)
                    .map_err(query_err)?
                    .into_execution()
            })
            .collect()
    }

    async fn claim_node_execution(
        &self,
        entry: &NodeExecution,
        allow_after_failure: bool,
    ) -> Result<NodeClaim, RepositoryError> {
        let input = entry.input_data.as_ref().map(to_json).transpose()?;
        let allow = i64::from(allow_after_failure);

        let claim_sql = format!(
            r#"INSERT INTO node_executions
               (id, execution_id, node_id, node_type, attempt, status, input_data, started_at)
               SELECT ?, ?, ?, ?, ?, ?, ?, ?
               WHERE NOT EXISTS (
                 SELECT 1 FROM node_executions
                 WHERE execution_id = ? AND node_id = ? AND {BLOCKING_CLAUSE}
               )"#
        );
        let result = sqlx::query(&claim_sql)
            .bind(entry.id.to_string())
            .bind(entry.execution_id.to_string())
            .bind(&entry.node_id)
            .bind(&entry.node_type)
            .bind(entry.attempt as i64)
            .bind(entry.status.as_str())
            .bind(&input)
            .bind(format_datetime(&entry.started_at))
            .bind(entry.execution_id.to_string())
            .bind(&entry.node_id)
            .bind(allow)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        if result.rows_affected() > 0 {
            return Ok(NodeClaim::Claimed);
        }

        let blocking_sql = format!(
            "SELECT * FROM node_executions WHERE execution_id = ? AND node_id = ? AND {BLOCKING_CLAUSE} \
             ORDER BY attempt DESC LIMIT 1"
        );
        let row = sqlx::query(&blocking_sql)
            .bind(entry.execution_id.to_string())
            .bind(&entry.node_id)
            .bind(allow)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => Ok(NodeClaim::Existing(
                NodeExecutionRow::from_row(&row)
                    .map_err(query_err)?
                    .into_node_execution()?,
            )),
            // The blocking attempt was superseded between the two statements.
            None => Err(RepositoryError::Conflict(format!(
                "claim for node '{}' raced with another writer",
                entry.node_id
            ))),
        }
    }

    async fn finish_node_execution(
        &self,
        id: &Uuid,
        status: NodeExecutionStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let output = output.map(to_json).transpose()?;
        let result = sqlx::query(
            r#"UPDATE node_executions
               SET status = ?, output_data = ?, error_message = ?, completed_at = ?
               WHERE id = ? AND status = 'running'"#,
        )
        .bind(status.as_str())
        .bind(&output)
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_node_executions(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM node_executions WHERE execution_id = ? ORDER BY started_at ASC, id ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                NodeExecutionRow::from_row(row)
                    .map_err(query_err)?
                    .into_node_execution()
            })
            .collect()
    }

    async fn latest_node_execution(
        &self,
        execution_id: &Uuid,
        node_id: &str,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM node_executions WHERE execution_id = ? AND node_id = ? \
             ORDER BY attempt DESC LIMIT 1",
        )
        .bind(execution_id.to_string())
        .bind(node_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.map(|row| {
            NodeExecutionRow::from_row(&row)
                .map_err(query_err)?
                .into_node_execution()
        })
        .transpose()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
