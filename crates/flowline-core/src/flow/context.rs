//! Context merge patches.
//!
//! A dispatch sees an immutable snapshot of the execution context and the
//! engine turns its result into a `ContextPatch`. Applying a patch is a
//! pure function of the current record, so the store can re-apply it
//! after a version conflict.

use chrono::Utc;
use flowline_types::execution::{Execution, ExecutionContext, ExecutionStatus, LAST_NODE_KEY};
use serde_json::{Value, json};

/// Output recorded for a node whose dispatch failed.
pub fn failure_output(error: &str) -> Value {
    json!({ "success": false, "error": error })
}

/// Dispatch snapshot: the persisted context overlaid with the trigger's
/// incoming context. Incoming keys win.
pub fn snapshot(persisted: &ExecutionContext, incoming: &ExecutionContext) -> ExecutionContext {
    let mut merged = persisted.clone();
    for (key, value) in incoming {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Merge patch for one execution record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextPatch {
    /// Top-level context entries to set, keyed by node ID.
    pub node_outputs: ExecutionContext,
    pub last_node: Option<String>,
    pub current_node_id: Option<String>,
    /// Requested status. Ignored once the record is terminal.
    pub status: Option<ExecutionStatus>,
    pub error: Option<String>,
}

impl ContextPatch {
    /// Patch recording that `node_id` finished with `output`.
    pub fn node_finished(node_id: &str, output: Value) -> Self {
        let mut node_outputs = ExecutionContext::new();
        node_outputs.insert(node_id.to_string(), output);
        Self {
            node_outputs,
            last_node: Some(node_id.to_string()),
            current_node_id: Some(node_id.to_string()),
            ..Default::default()
        }
    }

    /// Patch failing the run with `error`.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            status: Some(ExecutionStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Produce the next state of `current`. Bumps `version` by one.
    ///
    /// Status is monotonic: a terminal record keeps its status, error and
    /// completion time.
    pub fn apply(&self, current: &Execution) -> Execution {
        let mut next = current.clone();

        for (key, value) in &self.node_outputs {
            next.context.insert(key.clone(), value.clone());
        }
        if let Some(last) = &self.last_node {
            next.context
                .insert(LAST_NODE_KEY.to_string(), Value::String(last.clone()));
        }
        if let Some(node_id) = &self.current_node_id {
            next.current_node_id = Some(node_id.clone());
        }

        if !current.status.is_terminal() {
            if let Some(status) = self.status {
                transition(&mut next, status);
                if status == ExecutionStatus::Failed {
                    next.error = self.error.clone();
                }
            }
        }

        next.version = current.version + 1;
        next
    }
}

/// Move a running record to `status`, stamping `completed_at` when it
/// becomes terminal.
pub fn transition(execution: &mut Execution, status: ExecutionStatus) {
    if execution.status.is_terminal() {
        return;
    }
    execution.status = status;
    if status.is_terminal() {
        execution.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn running() -> Execution {
        Execution::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            ExecutionContext::new(),
        )
    }

    #[test]
    fn test_node_outputs_accumulate_with_last_node() {
        let exec = running();
        let after_x = ContextPatch::node_finished("x", json!({"score": 1})).apply(&exec);
        let after_y = ContextPatch::node_finished("y", json!({"sent": true})).apply(&after_x);

        assert_eq!(after_y.context["x"], json!({"score": 1}));
        assert_eq!(after_y.context["y"], json!({"sent": true}));
        assert_eq!(after_y.last_node(), Some("y"));
        assert_eq!(after_y.current_node_id.as_deref(), Some("y"));
        assert_eq!(after_y.version, 2);
    }

    #[test]
    fn test_fail_sets_error_and_completed_at() {
        let failed = ContextPatch::fail("node 'ghost' not found").apply(&running());
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("node 'ghost' not found"));
        assert!(failed.completed_at.is_some());
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut done = running();
        transition(&mut done, ExecutionStatus::Completed);
        let stamped = done.completed_at;

        let after = ContextPatch::fail("late failure").apply(&done);
        assert_eq!(after.status, ExecutionStatus::Completed);
        assert!(after.error.is_none());
        assert_eq!(after.completed_at, stamped);

        let mut reopened = after.clone();
        transition(&mut reopened, ExecutionStatus::Running);
        assert_eq!(reopened.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_snapshot_prefers_incoming() {
        let persisted = json!({"a": 1, "b": 2}).as_object().cloned().unwrap();
        let incoming = json!({"b": 3, "c": 4}).as_object().cloned().unwrap();
        let merged = snapshot(&persisted, &incoming);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 3);
        assert_eq!(merged["c"], 4);
    }

    #[test]
    fn test_failure_output_shape() {
        assert_eq!(
            failure_output("timeout"),
            json!({"success": false, "error": "timeout"})
        );
    }
}
