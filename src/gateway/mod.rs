//! Planning and generating gateways
//!
//! The controller never talks to a planner directly. It builds a
//! [`GatewayRequest`] envelope (current location, progress, context
//! snapshot, FSM state) and hands it to a [`Gateway`]:
//!
//! - `plan` answers stage generation, step generation, and behavior
//!   arrangement with a single JSON document
//! - `generate` answers action generation with a lazily consumed stream
//!   of [`ExecutionStep`]s

mod http;
mod retry;

pub use http::HttpGateway;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

use crate::action::ExecutionStep;
use crate::context::{ContextSnapshot, EffectLog};
use crate::progress::ProgressTracker;
use crate::workflow::{TransitionRecord, WorkflowSession, WorkflowState};
use crate::Result;

/// Lazily consumed action sequence from the generating gateway
pub type ActionStream = BoxStream<'static, Result<ExecutionStep>>;

/// Which call the envelope is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    StageGeneration,
    StepGeneration,
    BehaviorArrangement,
    ActionGeneration,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::StageGeneration => write!(f, "stage_generation"),
            RequestKind::StepGeneration => write!(f, "step_generation"),
            RequestKind::BehaviorArrangement => write!(f, "behavior_arrangement"),
            RequestKind::ActionGeneration => write!(f, "action_generation"),
        }
    }
}

/// Ids of the current stage, step, and behavior
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentIds {
    pub stage_id: Option<String>,
    pub step_id: Option<String>,
    pub behavior_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub current: CurrentIds,
    pub progress: ProgressTracker,
    /// Goals note of the innermost tier that has one
    #[serde(default)]
    pub goals: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmInfo {
    pub state: WorkflowState,
    #[serde(default)]
    pub last_transition: Option<TransitionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub variables: HashMap<String, Value>,
    pub effects: EffectLog,
    pub todo: Vec<String>,
    pub custom: Map<String, Value>,
    #[serde(rename = "FSM")]
    pub fsm: FsmInfo,
}

/// Envelope sent with every gateway call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub kind: RequestKind,
    /// Ask the planner to evaluate whether the target is already met
    pub reflection: bool,
    pub location: Location,
    pub context: RequestContext,
    /// Prefer an NDJSON response (generating calls only)
    #[serde(default)]
    pub stream: bool,
}

impl GatewayRequest {
    /// Build an envelope from the session's current state
    pub fn build(
        kind: RequestKind,
        session: &WorkflowSession,
        state: WorkflowState,
        last_transition: Option<TransitionRecord>,
        reflection: bool,
    ) -> Self {
        let progress = &session.progress;
        let goals = [
            progress.behaviors.notes(),
            progress.steps.notes(),
            progress.stages.notes(),
        ]
        .into_iter()
        .find_map(|n| n.goals.clone());

        let ContextSnapshot {
            variables,
            effects,
            todo,
            custom,
        } = session.context.snapshot();

        Self {
            kind,
            reflection,
            location: Location {
                current: CurrentIds {
                    stage_id: progress.current_stage_id().map(str::to_string),
                    step_id: progress.current_step_id().map(str::to_string),
                    behavior_id: progress.current_behavior_id().map(str::to_string),
                },
                progress: progress.clone(),
                goals,
            },
            context: RequestContext {
                variables,
                effects,
                todo,
                custom,
                fsm: FsmInfo {
                    state,
                    last_transition,
                },
            },
            stream: kind == RequestKind::ActionGeneration,
        }
    }
}

/// Planner/generator backend
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    /// Planning call: stage generation, step generation, behavior arrangement
    async fn plan(&self, request: &GatewayRequest) -> Result<Value>;

    /// Generating call: the action sequence for the current behavior
    async fn generate(&self, request: &GatewayRequest) -> Result<ActionStream>;
}
