//! Node kinds: the closed set of step types the dispatcher understands.
//!
//! A `NodeDefinition` carries a raw type string and a JSON config. `NodeKind`
//! resolves both into a typed variant. Legacy type names map onto `AiStep`
//! with a fixed action, and anything unrecognised becomes `Unknown`.

use flowline_types::flow::NodeDefinition;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::definition::FlowError;

/// What an AI step is asked to do. Only shapes the default instruction;
/// every action goes to the same handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AiAction {
    Analyze,
    DraftMessage,
    SendMessage,
    Research,
    FollowUp,
    #[default]
    Custom,
}

impl AiAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AiAction::Analyze => "analyze",
            AiAction::DraftMessage => "draft_message",
            AiAction::SendMessage => "send_message",
            AiAction::Research => "research",
            AiAction::FollowUp => "follow_up",
            AiAction::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AiStepConfig {
    #[serde(default)]
    pub action: AiAction,
    /// Prompt template; see `prompt::render_template`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Overrides the flow persona for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Outreach channel for messaging steps (email, linkedin, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// One arm of a multi-way condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionCase {
    pub when: String,
    pub branch: String,
}

/// How a condition node picks its branch.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionConfig {
    /// Boolean predicate mapped onto two labels.
    Binary {
        expression: String,
        true_branch: String,
        false_branch: String,
    },
    /// First matching case wins; `default_branch` otherwise.
    Cases {
        cases: Vec<ConditionCase>,
        default_branch: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawCondition {
    #[serde(default)]
    expression: Option<String>,
    #[serde(default)]
    true_branch: Option<String>,
    #[serde(default)]
    false_branch: Option<String>,
    #[serde(default)]
    cases: Vec<ConditionCase>,
    #[serde(default)]
    default_branch: Option<String>,
}

/// Scoped patch applied to the target entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatusConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Field that receives `status`.
    #[serde(default = "default_status_field")]
    pub status_field: String,
    /// Extra fields merged into the entity.
    #[serde(default)]
    pub fields: serde_json::Map<String, Value>,
}

fn default_status_field() -> String {
    "status".to_string()
}

impl UpdateStatusConfig {
    /// The full field patch this node applies.
    pub fn patch(&self) -> serde_json::Map<String, Value> {
        let mut patch = self.fields.clone();
        if let Some(status) = &self.status {
            patch.insert(self.status_field.clone(), Value::String(status.clone()));
        }
        patch
    }
}

// ---------------------------------------------------------------------------
// NodeKind
// ---------------------------------------------------------------------------

/// Typed view of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    AiStep(AiStepConfig),
    Condition(ConditionConfig),
    UpdateStatus(UpdateStatusConfig),
    End,
    /// Unrecognised type; dispatched as a pass-through.
    Unknown { node_type: String },
}

impl NodeKind {
    /// Whether a raw type string denotes the terminal node.
    pub fn is_end_type(node_type: &str) -> bool {
        node_type == "end"
    }

    /// Resolve a node definition into its kind, validating the config.
    pub fn parse(node: &NodeDefinition) -> Result<Self, FlowError> {
        let invalid = |reason: String| FlowError::InvalidNodeConfig {
            node_id: node.id.clone(),
            reason,
        };

        let ai_step = |action: Option<AiAction>,
                       channel: Option<&'static str>|
         -> Result<NodeKind, FlowError> {
            let mut config: AiStepConfig = decode(&node.config).map_err(invalid)?;
            if let Some(action) = action {
                config.action = action;
            }
            if config.channel.is_none() {
                config.channel = channel.map(String::from);
            }
            Ok(NodeKind::AiStep(config))
        };

        match node.node_type.as_str() {
            "ai_step" => ai_step(None, None),
            "ai_analysis" => ai_step(Some(AiAction::Analyze), None),
            "draft_message" => ai_step(Some(AiAction::DraftMessage), None),
            "send_message" => ai_step(Some(AiAction::SendMessage), None),
            "send_email" => ai_step(Some(AiAction::SendMessage), Some("email")),
            "send_linkedin" => ai_step(Some(AiAction::SendMessage), Some("linkedin")),
            "research" => ai_step(Some(AiAction::Research), None),
            "follow_up" => ai_step(Some(AiAction::FollowUp), None),
            "condition" | "branch" => {
                let raw: RawCondition = decode(&node.config).map_err(invalid)?;
                parse_condition(raw).map(NodeKind::Condition).map_err(invalid)
            }
            "update_status" => {
                let config: UpdateStatusConfig = decode(&node.config).map_err(invalid)?;
                if config.status.is_none() && config.fields.is_empty() {
                    return Err(invalid(
                        "update_status needs a status or at least one field".to_string(),
                    ));
                }
                Ok(NodeKind::UpdateStatus(config))
            }
            "end" => Ok(NodeKind::End),
            other => Ok(NodeKind::Unknown {
                node_type: other.to_string(),
            }),
        }
    }
}

/// Decode a node config, treating `null` as an empty object.
fn decode<T: serde::de::DeserializeOwned>(config: &Value) -> Result<T, String> {
    let config = if config.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        config.clone()
    };
    serde_json::from_value(config).map_err(|e| e.to_string())
}

fn parse_condition(raw: RawCondition) -> Result<ConditionConfig, String> {
    match (raw.expression, raw.cases.is_empty()) {
        (Some(expression), true) => Ok(ConditionConfig::Binary {
            expression,
            true_branch: raw.true_branch.unwrap_or_else(|| "yes".to_string()),
            false_branch: raw.false_branch.unwrap_or_else(|| "no".to_string()),
        }),
        (None, false) => Ok(ConditionConfig::Cases {
            cases: raw.cases,
            default_branch: raw.default_branch,
        }),
        (Some(_), false) => Err("use either `expression` or `cases`, not both".to_string()),
        (None, true) => Err("condition needs an `expression` or `cases`".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(node_type: &str, config: Value) -> NodeDefinition {
        NodeDefinition {
            id: "n".to_string(),
            node_type: node_type.to_string(),
            config,
        }
    }

    #[test]
    fn legacy_aliases_resolve_to_ai_step() {
        let cases = [
            ("ai_analysis", AiAction::Analyze, None),
            ("draft_message", AiAction::DraftMessage, None),
            ("send_email", AiAction::SendMessage, Some("email")),
            ("send_linkedin", AiAction::SendMessage, Some("linkedin")),
            ("research", AiAction::Research, None),
            ("follow_up", AiAction::FollowUp, None),
        ];
        for (node_type, action, channel) in cases {
            match NodeKind::parse(&node(node_type, json!({}))).unwrap() {
                NodeKind::AiStep(cfg) => {
                    assert_eq!(cfg.action, action, "{node_type}");
                    assert_eq!(cfg.channel.as_deref(), channel, "{node_type}");
                }
                other => panic!("{node_type} parsed as {other:?}"),
            }
        }
    }

    #[test]
    fn ai_step_reads_action_and_prompt() {
        let kind = NodeKind::parse(&node(
            "ai_step",
            json!({"action": "research", "prompt": "Look up {{ entity.company }}"}),
        ))
        .unwrap();
        let NodeKind::AiStep(cfg) = kind else {
            panic!("expected ai step");
        };
        assert_eq!(cfg.action, AiAction::Research);
        assert_eq!(cfg.prompt.as_deref(), Some("Look up {{ entity.company }}"));
    }

    #[test]
    fn explicit_channel_wins_over_alias_default() {
        let NodeKind::AiStep(cfg) =
            NodeKind::parse(&node("send_email", json!({"channel": "gmail"}))).unwrap()
        else {
            panic!("expected ai step");
        };
        assert_eq!(cfg.channel.as_deref(), Some("gmail"));
    }

    #[test]
    fn condition_defaults_to_yes_no() {
        let kind = NodeKind::parse(&node("branch", json!({"expression": "true"}))).unwrap();
        assert_eq!(
            kind,
            NodeKind::Condition(ConditionConfig::Binary {
                expression: "true".to_string(),
                true_branch: "yes".to_string(),
                false_branch: "no".to_string(),
            })
        );
    }

    #[test]
    fn condition_cases() {
        let kind = NodeKind::parse(&node(
            "condition",
            json!({
                "cases": [{"when": "entity.score > 80", "branch": "hot"}],
                "default_branch": "cold"
            }),
        ))
        .unwrap();
        let NodeKind::Condition(ConditionConfig::Cases { cases, default_branch }) = kind else {
            panic!("expected cases");
        };
        assert_eq!(cases.len(), 1);
        assert_eq!(default_branch.as_deref(), Some("cold"));
    }

    #[test]
    fn condition_without_predicate_is_invalid() {
        let err = NodeKind::parse(&node("condition", json!({}))).unwrap_err();
        assert!(matches!(err, FlowError::InvalidNodeConfig { .. }));
    }

    #[test]
    fn update_status_patch_includes_status_field() {
        let NodeKind::UpdateStatus(cfg) = NodeKind::parse(&node(
            "update_status",
            json!({"status": "contacted", "fields": {"owner": "bot"}}),
        ))
        .unwrap() else {
            panic!("expected update_status");
        };
        let patch = cfg.patch();
        assert_eq!(patch["status"], "contacted");
        assert_eq!(patch["owner"], "bot");
    }

    #[test]
    fn null_config_is_treated_as_empty() {
        assert!(matches!(
            NodeKind::parse(&node("research", Value::Null)).unwrap(),
            NodeKind::AiStep(_)
        ));
    }

    #[test]
    fn unknown_type_is_explicit_variant() {
        assert_eq!(
            NodeKind::parse(&node("wait_days", json!({"days": 3}))).unwrap(),
            NodeKind::Unknown {
                node_type: "wait_days".to_string()
            }
        );
        assert_eq!(NodeKind::parse(&node("end", json!({}))).unwrap(), NodeKind::End);
    }
}
