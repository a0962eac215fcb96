//! Target entity: the external business record a flow runs against.
//!
//! The engine never owns an entity's lifecycle. It reads its fields to
//! build prompts and predicates, and applies scoped field patches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A business record (prospect, candidate, customer) targeted by executions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetEntity {
    pub id: Uuid,
    pub workspace_id: Uuid,
    /// Free-form record fields (name, email, status, ...).
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl TargetEntity {
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}
