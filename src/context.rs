//! Context store
//!
//! Variables, a FIFO todo queue, the effect log, and the custom-context
//! overlay supplied by the host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};

use crate::notebook::Output;

/// Observable result of an action, projected from an output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    /// Cell the output belongs to, if any
    pub cell_id: Option<String>,
    /// Action type that produced it
    pub action_type: String,
    pub output: Output,
    pub recorded_at: DateTime<Utc>,
}

impl Effect {
    pub fn new(cell_id: Option<String>, action_type: &str, output: Output) -> Self {
        Self {
            cell_id,
            action_type: action_type.to_string(),
            output,
            recorded_at: Utc::now(),
        }
    }
}

/// Current batch plus permanent history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EffectLog {
    /// Effects of the running behavior iteration
    pub current: Vec<Effect>,
    /// Every effect of the session, never reset
    pub history: Vec<Effect>,
}

/// Serializable view of the context sent to the gateways
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub variables: HashMap<String, Value>,
    pub effects: EffectLog,
    pub todo: Vec<String>,
    pub custom: Map<String, Value>,
}

/// Workflow context
#[derive(Debug, Clone, Default)]
pub struct ContextStore {
    variables: HashMap<String, Value>,
    todo: VecDeque<String>,
    effects: EffectLog,
    custom: Map<String, Value>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with initial variables
    pub fn with_variables(variables: HashMap<String, Value>) -> Self {
        Self {
            variables,
            ..Default::default()
        }
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    pub fn push_todo(&mut self, item: impl Into<String>) {
        self.todo.push_back(item.into());
    }

    pub fn pop_todo(&mut self) -> Option<String> {
        self.todo.pop_front()
    }

    pub fn todo_len(&self) -> usize {
        self.todo.len()
    }

    /// Record an effect in both the current batch and the history
    pub fn append_effect(&mut self, effect: Effect) {
        self.effects.current.push(effect.clone());
        self.effects.history.push(effect);
    }

    /// Start a new behavior iteration: the current batch is emptied.
    pub fn begin_iteration(&mut self) {
        self.effects.current.clear();
    }

    pub fn effects(&self) -> &EffectLog {
        &self.effects
    }

    /// Shallow merge, last write wins
    pub fn merge_custom_context(&mut self, overlay: Map<String, Value>) {
        for (key, value) in overlay {
            self.custom.insert(key, value);
        }
    }

    pub fn custom_context(&self) -> &Map<String, Value> {
        &self.custom
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            variables: self.variables.clone(),
            effects: self.effects.clone(),
            todo: self.todo.iter().cloned().collect(),
            custom: self.custom.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_variables_overwrite() {
        let mut ctx = ContextStore::new();
        ctx.set_variable("user_problem", json!("X"));
        ctx.set_variable("user_problem", json!("Y"));
        assert_eq!(ctx.get_variable("user_problem"), Some(&json!("Y")));
        assert_eq!(ctx.get_variable("missing"), None);
    }

    #[test]
    fn test_todo_fifo() {
        let mut ctx = ContextStore::new();
        ctx.push_todo("load data");
        ctx.push_todo("plot");
        assert_eq!(ctx.pop_todo().as_deref(), Some("load data"));
        assert_eq!(ctx.pop_todo().as_deref(), Some("plot"));
        assert_eq!(ctx.pop_todo(), None);
    }

    #[test]
    fn test_effects_current_resets_history_stays() {
        let mut ctx = ContextStore::new();
        ctx.append_effect(Effect::new(Some("c1".into()), "execute-code", Output::stream("a")));
        ctx.append_effect(Effect::new(Some("c1".into()), "execute-code", Output::stream("b")));
        assert_eq!(ctx.effects().current.len(), 2);

        ctx.begin_iteration();
        assert!(ctx.effects().current.is_empty());
        assert_eq!(ctx.effects().history.len(), 2);

        ctx.append_effect(Effect::new(None, "execute-code", Output::stream("c")));
        assert_eq!(ctx.effects().current.len(), 1);
        assert_eq!(ctx.effects().history.len(), 3);
    }

    #[test]
    fn test_custom_context_last_write_wins() {
        let mut ctx = ContextStore::new();
        let mut first = Map::new();
        first.insert("dataset".into(), json!("a.csv"));
        first.insert("lang".into(), json!("en"));
        ctx.merge_custom_context(first);

        let mut second = Map::new();
        second.insert("dataset".into(), json!("b.csv"));
        ctx.merge_custom_context(second);

        assert_eq!(ctx.custom_context()["dataset"], json!("b.csv"));
        assert_eq!(ctx.custom_context()["lang"], json!("en"));
    }
}
