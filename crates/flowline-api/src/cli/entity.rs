//! CLI target entity subcommands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use console::style;
use serde::Deserialize;
use uuid::Uuid;

use flowline_core::repository::entity::EntityRepository;
use flowline_types::entity::TargetEntity;

use crate::state::AppState;

/// Target entity subcommands.
#[derive(Subcommand)]
pub enum EntityCommand {
    /// Insert or replace an entity from a YAML or JSON file.
    Put {
        /// Path to the entity file.
        file: PathBuf,
    },

    /// Show an entity's fields.
    Show {
        /// Entity UUID.
        id: Uuid,

        /// Workspace UUID owning the entity.
        #[arg(long)]
        workspace: Uuid,
    },
}

/// On-disk shape of an entity. `id` is generated when absent.
#[derive(Debug, Deserialize)]
struct EntityDocument {
    #[serde(default)]
    id: Option<Uuid>,
    workspace_id: Uuid,
    #[serde(default)]
    fields: serde_json::Map<String, serde_json::Value>,
}

impl EntityDocument {
    fn into_entity(self) -> TargetEntity {
        TargetEntity {
            id: self.id.unwrap_or_else(Uuid::now_v7),
            workspace_id: self.workspace_id,
            fields: self.fields,
            updated_at: chrono::Utc::now(),
        }
    }
}

fn parse_entity_document(path: &Path, content: &str) -> Result<EntityDocument> {
    let doc = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(content).context("Invalid entity JSON")?,
        _ => serde_yaml_ng::from_str(content).context("Invalid entity YAML")?,
    };
    Ok(doc)
}

pub async fn handle_entity_command(
    action: EntityCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match action {
        EntityCommand::Put { file } => handle_put(&file, state, json).await,
        EntityCommand::Show { id, workspace } => handle_show(id, workspace, state, json).await,
    }
}

async fn handle_put(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let entity = parse_entity_document(file, &content)?.into_entity();

    state
        .engine
        .entities()
        .save_entity(&entity)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to save entity: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entity)?);
    } else {
        println!();
        println!(
            "  {} Saved entity {}",
            style("*").green().bold(),
            style(entity.id).cyan()
        );
        println!("  Workspace: {}", entity.workspace_id);
        println!("  Fields:    {}", entity.fields.len());
        println!();
    }
    Ok(())
}

async fn handle_show(id: Uuid, workspace_id: Uuid, state: &AppState, json: bool) -> Result<()> {
    let entity = state
        .engine
        .entities()
        .get_entity(&workspace_id, &id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get entity: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Entity {id} not found in workspace {workspace_id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entity)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Entity:").bold(), style(entity.id).cyan());
    println!("  Updated: {}", entity.updated_at.to_rfc3339());
    for (key, value) in &entity.fields {
        println!("  {key}: {value}");
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_document_generates_id() {
        let doc = parse_entity_document(
            Path::new("lead.yaml"),
            "workspace_id: 0190f5a0-0000-7000-8000-000000000003\nfields:\n  name: Ada\n  status: new\n",
        )
        .unwrap();
        let entity = doc.into_entity();
        assert_eq!(entity.fields["name"], "Ada");
        assert_eq!(entity.fields["status"], "new");
        assert!(!entity.id.is_nil());
    }

    #[test]
    fn test_json_document_keeps_id() {
        let doc = parse_entity_document(
            Path::new("lead.json"),
            r#"{"id":"0190f5a0-0000-7000-8000-000000000009","workspace_id":"0190f5a0-0000-7000-8000-000000000003"}"#,
        )
        .unwrap();
        assert_eq!(
            doc.into_entity().id.to_string(),
            "0190f5a0-0000-7000-8000-000000000009"
        );
    }

    #[test]
    fn test_missing_workspace_is_rejected() {
        assert!(parse_entity_document(Path::new("lead.json"), r#"{"fields":{}}"#).is_err());
    }
}
