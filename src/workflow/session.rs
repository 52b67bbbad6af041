//! Per-workflow session state

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::context::ContextStore;
use crate::notebook::NotebookStore;
use crate::progress::ProgressTracker;

/// Notebook, context, and progress owned by exactly one workflow
#[derive(Debug, Clone)]
pub struct WorkflowSession {
    pub id: String,
    pub notebook: NotebookStore,
    pub context: ContextStore,
    pub progress: ProgressTracker,
    pub created_at: DateTime<Utc>,
}

impl Default for WorkflowSession {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowSession {
    pub fn new() -> Self {
        Self::with_variables(HashMap::new())
    }

    /// Session whose context starts with `variables`, e.g. `user_problem`
    pub fn with_variables(variables: HashMap<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            notebook: NotebookStore::new(),
            context: ContextStore::with_variables(variables),
            progress: ProgressTracker::new(),
            created_at: Utc::now(),
        }
    }

    /// Fresh stores under a new id, keeping the seed variables and overlay
    pub fn reset(&mut self, variables: HashMap<String, Value>, custom: Map<String, Value>) {
        *self = Self::with_variables(variables);
        self.context.merge_custom_context(custom);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebook::CellType;
    use serde_json::json;

    #[test]
    fn test_sessions_are_independent() {
        let mut a = WorkflowSession::new();
        let b = WorkflowSession::new();
        a.notebook.add_cell(CellType::Text, "only in a");

        assert_ne!(a.id, b.id);
        assert!(b.notebook.is_empty());
    }

    #[test]
    fn test_reset() {
        let mut vars = HashMap::new();
        vars.insert("user_problem".to_string(), json!("X"));
        let mut session = WorkflowSession::with_variables(vars.clone());
        let old_id = session.id.clone();
        session.notebook.add_cell(CellType::Code, "1");
        session.context.set_variable("tmp", json!(1));

        let mut custom = Map::new();
        custom.insert("dataset".into(), json!("d.csv"));
        session.reset(vars, custom);

        assert_ne!(session.id, old_id);
        assert!(session.notebook.is_empty());
        assert_eq!(session.context.get_variable("user_problem"), Some(&json!("X")));
        assert!(session.context.get_variable("tmp").is_none());
        assert_eq!(session.context.custom_context()["dataset"], json!("d.csv"));
    }
}
