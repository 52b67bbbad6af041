//! Action registry and dispatcher
//!
//! Actions arrive from the generating gateway as [`ExecutionStep`]s and are
//! routed by their exact `action_type` string to a registered
//! [`ActionHandler`]. New action types are added by registration alone;
//! re-registering a type replaces its handler.
//!
//! Around every handler run an ordered chain of pre-hooks and post-hooks.
//! Hook failures are logged and swallowed (see [`hooks`]).

pub mod builtin;
pub mod hooks;

pub use builtin::register_defaults;
pub use hooks::{HookChain, PostHook, PreHook};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::context::Effect;
use crate::executor::CodeExecutor;
use crate::notebook::Output;
use crate::workflow::WorkflowSession;
use crate::{Error, Result};

/// Action descriptor as sent by the generating gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDescriptor {
    #[serde(alias = "action", alias = "type")]
    pub action_type: String,
    #[serde(default)]
    pub sequence_number: u64,
    #[serde(default)]
    pub payload: Value,
}

/// A single atomic operation, consumed exactly once by the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub action_type: String,
    #[serde(default)]
    pub sequence_number: u64,
    /// Cell id or a symbolic alias such as `last-added-cell`
    #[serde(default)]
    pub target: Option<String>,
    /// Text or code payload
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExecutionStep {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            sequence_number: 0,
            target: None,
            content: None,
            metadata: Map::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_sequence(mut self, sequence_number: u64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// String metadata value
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Lift a wire descriptor into a step.
    ///
    /// An object payload contributes `target` (or `cell_id`), `content`
    /// (or `code` / `text`), and everything else as metadata. A string
    /// payload is the content.
    pub fn from_descriptor(descriptor: ActionDescriptor) -> Result<Self> {
        if descriptor.action_type.trim().is_empty() {
            return Err(Error::Validation(
                "Action descriptor has an empty action_type".to_string(),
            ));
        }

        let mut step = ExecutionStep::new(descriptor.action_type)
            .with_sequence(descriptor.sequence_number);

        match descriptor.payload {
            Value::Null => {}
            Value::String(content) => step.content = Some(content),
            Value::Object(mut obj) => {
                step.target = take_string(&mut obj, &["target", "cell_id"]);
                step.content = take_string(&mut obj, &["content", "code", "text"]);
                if let Some(Value::Object(meta)) = obj.remove("metadata") {
                    step.metadata.extend(meta);
                }
                step.metadata.extend(obj);
            }
            other => {
                return Err(Error::Validation(format!(
                    "Action {} has an unsupported payload: {}",
                    step.action_type, other
                )))
            }
        }

        Ok(step)
    }
}

fn take_string(obj: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(value) = obj.remove(*key) {
            return match value {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            };
        }
    }
    None
}

/// What dispatching an action produced
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// The handler committed its change
    Applied {
        cell_id: Option<String>,
        outputs: Vec<Output>,
    },
    /// Nothing to do, e.g. no executor configured
    NoResult,
    /// The current step's acceptance criteria were reported satisfied
    StepSatisfied,
    /// No handler registered for the action type
    Refused { reason: String },
    /// The handler failed; the failure was recorded as data
    Failed { error: String },
}

impl ActionOutcome {
    pub fn cell(cell_id: impl Into<String>) -> Self {
        ActionOutcome::Applied {
            cell_id: Some(cell_id.into()),
            outputs: Vec::new(),
        }
    }

    pub fn is_refused(&self) -> bool {
        matches!(self, ActionOutcome::Refused { .. })
    }
}

/// Everything a handler may touch
pub struct ActionContext<'a> {
    pub session: &'a mut WorkflowSession,
    pub executor: Option<&'a dyn CodeExecutor>,
}

impl<'a> ActionContext<'a> {
    pub fn new(session: &'a mut WorkflowSession, executor: Option<&'a dyn CodeExecutor>) -> Self {
        Self { session, executor }
    }
}

/// One action type's implementation
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, step: &ExecutionStep, ctx: &mut ActionContext<'_>)
        -> Result<ActionOutcome>;
}

/// Registry of handlers plus the hook chain
#[derive(Default)]
pub struct ActionDispatcher {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    hooks: HookChain,
}

impl ActionDispatcher {
    /// Empty dispatcher, no handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher with the built-in handlers registered
    pub fn with_defaults() -> Self {
        let mut dispatcher = Self::new();
        register_defaults(&mut dispatcher);
        dispatcher
    }

    /// Register a handler, returning the one it replaced
    pub fn register(
        &mut self,
        action_type: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Option<Arc<dyn ActionHandler>> {
        let action_type = action_type.into();
        debug!("Registering action handler: {}", action_type);
        self.handlers.insert(action_type, handler)
    }

    pub fn add_pre_hook(&mut self, hook: Arc<dyn PreHook>) {
        self.hooks.add_pre(hook);
    }

    pub fn add_post_hook(&mut self, hook: Arc<dyn PostHook>) {
        self.hooks.add_post(hook);
    }

    pub fn handles(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    /// Registered action types, sorted
    pub fn action_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(|k| k.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Run one step through hooks and its handler.
    ///
    /// Only fatal handler errors are returned as `Err`; every other failure
    /// becomes [`ActionOutcome::Failed`] and is recorded in the effect log
    /// (and on the target cell when the step names one).
    pub async fn dispatch(
        &self,
        step: &ExecutionStep,
        ctx: &mut ActionContext<'_>,
    ) -> Result<ActionOutcome> {
        let Some(handler) = self.handlers.get(&step.action_type).cloned() else {
            warn!(
                "Refusing action #{}: no handler for '{}'",
                step.sequence_number, step.action_type
            );
            return Ok(ActionOutcome::Refused {
                reason: format!("Unknown action type: {}", step.action_type),
            });
        };

        self.hooks.run_pre(step, &*ctx.session).await;

        let outcome = match handler.handle(step, ctx).await {
            Ok(outcome) => {
                info!(
                    "Action #{} {} done: {}",
                    step.sequence_number,
                    step.action_type,
                    describe(&outcome)
                );
                outcome
            }
            Err(e) if e.is_fatal() => {
                error!("Action {} failed fatally: {}", step.action_type, e);
                return Err(e);
            }
            Err(e) => {
                warn!("Action {} failed: {}", step.action_type, e);
                record_failure(step, &e, ctx);
                ActionOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        self.hooks.run_post(step, &outcome, &*ctx.session).await;

        Ok(outcome)
    }
}

fn describe(outcome: &ActionOutcome) -> String {
    match outcome {
        ActionOutcome::Applied { cell_id, outputs } => format!(
            "cell {} ({} outputs)",
            cell_id.as_deref().unwrap_or("-"),
            outputs.len()
        ),
        ActionOutcome::NoResult => "no result".to_string(),
        ActionOutcome::StepSatisfied => "step satisfied".to_string(),
        ActionOutcome::Refused { reason } => format!("refused ({})", reason),
        ActionOutcome::Failed { error } => format!("failed ({})", error),
    }
}

/// Failed output on the named cell (if any) and in the effect log
fn record_failure(step: &ExecutionStep, error: &Error, ctx: &mut ActionContext<'_>) {
    let output = Output::failure(error.to_string());
    let cell_id = step
        .target
        .as_deref()
        .and_then(|t| ctx.session.notebook.resolve(Some(t)).ok());

    if let Some(id) = &cell_id {
        // The cell was just resolved, the append cannot miss.
        let _ = ctx.session.notebook.append_output(id, output.clone());
    }
    ctx.session
        .context
        .append_effect(Effect::new(cell_id, &step.action_type, output));
}

impl std::fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("action_types", &self.action_types())
            .field("hooks", &self.hooks)
            .finish()
    }
}
