//! JEXL predicate evaluation for condition nodes.
//!
//! Wraps `jexl_eval::Evaluator` with string/collection transforms and builds
//! the scope predicates see: `context`, `entity` and `execution`.
//!
//! Node outputs and entity fields are always passed as the evaluation
//! context, never spliced into the expression text.

use flowline_types::entity::TargetEntity;
use flowline_types::execution::ExecutionContext;
use serde_json::{Value, json};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid scope: {0}")]
    InvalidScope(String),
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Identifiers of the execution a predicate runs in.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRef {
    pub execution_id: Uuid,
    pub workspace_id: Uuid,
    pub target_entity_id: Uuid,
}

/// Build the JSON object predicates and prompt templates resolve against.
///
/// ```json
/// {
///   "context":   { "<node_id>": <output>, "last_node": "..." },
///   "entity":    { <entity fields> },
///   "execution": { "id": "...", "workspace_id": "...", "target_entity_id": "..." }
/// }
/// ```
pub fn build_scope(
    execution: ExecutionRef,
    entity: &TargetEntity,
    context: &ExecutionContext,
) -> Value {
    json!({
        "context": context,
        "entity": entity.fields,
        "execution": {
            "id": execution.execution_id,
            "workspace_id": execution.workspace_id,
            "target_entity_id": execution.target_entity_id,
        }
    })
}

// ---------------------------------------------------------------------------
// FlowEvaluator
// ---------------------------------------------------------------------------

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(|v| v.as_str()).unwrap_or("")
}

/// JEXL evaluator with the standard transforms registered.
pub struct FlowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl FlowEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("split", |args: &[Value]| {
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = str_arg(args, 0).split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                // Strings search by substring, arrays by element equality.
                let found = match args.first() {
                    Some(Value::Array(items)) => {
                        args.get(1).is_some_and(|needle| items.contains(needle))
                    }
                    _ => str_arg(args, 0).contains(str_arg(args, 1)),
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression and coerce the result with JavaScript-like
    /// truthiness. `scope` must be a JSON object.
    pub fn evaluate_bool(&self, expression: &str, scope: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, scope).map(|v| truthy(&v))
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, scope: &Value) -> Result<Value, ExpressionError> {
        if !scope.is_object() {
            return Err(ExpressionError::InvalidScope(
                "scope must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, scope)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for FlowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scope() -> Value {
        let entity = TargetEntity {
            id: Uuid::now_v7(),
            workspace_id: Uuid::now_v7(),
            fields: json!({
                "name": "  Ada Lovelace ",
                "email": "ada@example.com",
                "score": 82,
                "tags": ["vip", "eu"]
            })
            .as_object()
            .cloned()
            .unwrap(),
            updated_at: Utc::now(),
        };
        let context = json!({
            "analyze": {"score": 91, "summary": "Strong fit"},
            "last_node": "analyze"
        })
        .as_object()
        .cloned()
        .unwrap();
        build_scope(
            ExecutionRef {
                execution_id: Uuid::now_v7(),
                workspace_id: entity.workspace_id,
                target_entity_id: entity.id,
            },
            &entity,
            &context,
        )
    }

    #[test]
    fn test_context_and_entity_paths() {
        let eval = FlowEvaluator::new();
        let s = scope();
        assert!(eval.evaluate_bool("context.analyze.score > 70", &s).unwrap());
        assert!(eval.evaluate_bool("entity.score >= 80 && context.last_node == 'analyze'", &s).unwrap());
        assert!(!eval.evaluate_bool("entity.score > 90", &s).unwrap());
    }

    #[test]
    fn test_execution_ids_in_scope() {
        let eval = FlowEvaluator::new();
        let s = scope();
        let id = eval.evaluate_value("execution.target_entity_id", &s).unwrap();
        assert_eq!(id, s["execution"]["target_entity_id"]);
    }

    #[test]
    fn test_string_transforms() {
        let eval = FlowEvaluator::new();
        let s = scope();
        assert_eq!(
            eval.evaluate_value("entity.name|trim|lower", &s).unwrap(),
            json!("ada lovelace")
        );
        assert!(eval.evaluate_bool("entity.email|endsWith('@example.com')", &s).unwrap());
        assert!(eval.evaluate_bool("entity.email|startsWith('ada')", &s).unwrap());
        assert!(eval.evaluate_bool("context.analyze.summary|contains('fit')", &s).unwrap());
        assert_eq!(
            eval.evaluate_value("entity.email|split('@')|length", &s).unwrap(),
            json!(2.0)
        );
    }

    #[test]
    fn test_contains_on_arrays() {
        let eval = FlowEvaluator::new();
        let s = scope();
        assert!(eval.evaluate_bool("entity.tags|contains('vip')", &s).unwrap());
        assert!(!eval.evaluate_bool("entity.tags|contains('us')", &s).unwrap());
    }

    #[test]
    fn test_missing_path_is_falsy() {
        let eval = FlowEvaluator::new();
        let s = scope();
        assert!(!eval.evaluate_bool("context.research", &s).unwrap());
        assert!(eval.evaluate_bool("(context.research)|not", &s).unwrap());
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("x")));
        assert!(!truthy(&json!(0)));
        assert!(truthy(&json!(2.5)));
        assert!(truthy(&json!([])));
        assert!(!truthy(&Value::Null));
    }

    #[test]
    fn test_scope_must_be_object() {
        let eval = FlowEvaluator::new();
        assert!(matches!(
            eval.evaluate_bool("true", &json!([1, 2])),
            Err(ExpressionError::InvalidScope(_))
        ));
    }

    #[test]
    fn test_syntax_error_is_eval_failure() {
        let eval = FlowEvaluator::new();
        assert!(matches!(
            eval.evaluate_bool("context.analyze.score >", &scope()),
            Err(ExpressionError::EvalFailed(_))
        ));
    }
}
