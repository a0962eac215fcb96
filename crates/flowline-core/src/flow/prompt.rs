//! Prompt assembly for AI steps.
//!
//! Templates reference the predicate scope with `{{ path }}` markers, e.g.
//! `{{ entity.name }}` or `{{ context.research.summary }}`. References that
//! do not resolve render as empty text.

use serde_json::Value;

use super::handler::PromptMessage;
use super::node::{AiAction, AiStepConfig};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an assistant executing one step of an automated business workflow.";

/// Replace every `{{ path }}` marker in `template` with the value found at
/// `path` inside `scope`.
pub fn render_template(template: &str, scope: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let path = rest[start + 2..start + 2 + len].trim();
        if let Some(value) = lookup(scope, path) {
            out.push_str(&value_to_text(value));
        }
        rest = &rest[start + 2 + len + 2..];
    }

    out.push_str(rest);
    out
}

/// Resolve a dotted path (`a.b.0.c`) inside a JSON value.
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(scope, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn default_instruction(config: &AiStepConfig) -> String {
    match config.action {
        AiAction::Analyze => {
            "Analyze this record. Summarize its fit, the key facts, and the recommended next step."
                .to_string()
        }
        AiAction::DraftMessage => {
            "Draft a short, personalized outreach message for this record.".to_string()
        }
        AiAction::SendMessage => format!(
            "Write and send the outreach message for this record via {}.",
            config.channel.as_deref().unwrap_or("the configured channel")
        ),
        AiAction::Research => {
            "Research this record and report background relevant to outreach.".to_string()
        }
        AiAction::FollowUp => {
            "Write a follow-up that builds on the previous outreach to this record.".to_string()
        }
        AiAction::Custom => "Complete this workflow step for the record.".to_string(),
    }
}

/// System prompt precedence: node override, then flow persona, then a
/// generic default.
pub fn system_prompt(config: &AiStepConfig, persona: Option<&str>, scope: &Value) -> String {
    config
        .system_prompt
        .as_deref()
        .or(persona)
        .map(|p| render_template(p, scope))
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
}

/// The instruction message followed by a snapshot of the record and the
/// accumulated context.
pub fn build_messages(config: &AiStepConfig, scope: &Value) -> Vec<PromptMessage> {
    let instruction = config
        .prompt
        .as_deref()
        .map(|t| render_template(t, scope))
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| default_instruction(config));

    let snapshot = |key: &str| {
        scope
            .get(key)
            .and_then(|v| serde_json::to_string_pretty(v).ok())
            .unwrap_or_else(|| "{}".to_string())
    };

    vec![
        PromptMessage::user(instruction),
        PromptMessage::user(format!(
            "Record:\n{}\n\nWorkflow context so far:\n{}",
            snapshot("entity"),
            snapshot("context")
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "entity": {"name": "Ada", "company": "Analytical Engines", "tags": ["vip"]},
            "context": {"research": {"summary": "Builds engines"}},
            "execution": {"id": "exec-1"}
        })
    }

    #[test]
    fn test_render_resolves_nested_paths() {
        let out = render_template(
            "Hi {{ entity.name }} from {{entity.company}}: {{ context.research.summary }}",
            &scope(),
        );
        assert_eq!(out, "Hi Ada from Analytical Engines: Builds engines");
    }

    #[test]
    fn test_render_array_index_and_missing() {
        let out = render_template("[{{ entity.tags.0 }}][{{ entity.phone }}]", &scope());
        assert_eq!(out, "[vip][]");
    }

    #[test]
    fn test_render_non_string_values_as_json() {
        let out = render_template("{{ context.research }}", &scope());
        assert_eq!(out, r#"{"summary":"Builds engines"}"#);
    }

    #[test]
    fn test_render_unterminated_marker_kept() {
        assert_eq!(render_template("Hi {{ entity.name", &scope()), "Hi {{ entity.name");
    }

    #[test]
    fn test_system_prompt_precedence() {
        let mut config = AiStepConfig::default();
        assert_eq!(system_prompt(&config, None, &scope()), DEFAULT_SYSTEM_PROMPT);
        assert_eq!(
            system_prompt(&config, Some("Persona for {{ entity.company }}"), &scope()),
            "Persona for Analytical Engines"
        );
        config.system_prompt = Some("Node override".to_string());
        assert_eq!(system_prompt(&config, Some("Persona"), &scope()), "Node override");
    }

    #[test]
    fn test_messages_use_prompt_or_action_default() {
        let config = AiStepConfig {
            action: AiAction::SendMessage,
            channel: Some("linkedin".to_string()),
            ..Default::default()
        };
        let messages = build_messages(&config, &scope());
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("via linkedin"));
        assert!(messages[1].content.contains("Analytical Engines"));
        assert!(messages[1].content.contains("Builds engines"));

        let custom = AiStepConfig {
            prompt: Some("Email {{ entity.name }}".to_string()),
            ..Default::default()
        };
        assert_eq!(build_messages(&custom, &scope())[0].content, "Email Ada");
    }
}
