//! Workflow FSM states and transition records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// States of the workflow FSM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// Nothing planned yet
    #[default]
    Idle,
    /// A stage is current, its steps are being planned
    StageRunning,
    /// A step is current, its next behavior is being arranged
    StepRunning,
    /// A behavior is current, its actions are being generated
    BehaviorRunning,
    /// Actions of the current behavior are being dispatched
    ActionRunning,
    /// The current step is done
    StepCompleted,
    /// Terminal failure
    Error,
    /// Every stage is done
    Completed,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::Idle => write!(f, "IDLE"),
            WorkflowState::StageRunning => write!(f, "STAGE_RUNNING"),
            WorkflowState::StepRunning => write!(f, "STEP_RUNNING"),
            WorkflowState::BehaviorRunning => write!(f, "BEHAVIOR_RUNNING"),
            WorkflowState::ActionRunning => write!(f, "ACTION_RUNNING"),
            WorkflowState::StepCompleted => write!(f, "STEP_COMPLETED"),
            WorkflowState::Error => write!(f, "ERROR"),
            WorkflowState::Completed => write!(f, "COMPLETED"),
        }
    }
}

impl WorkflowState {
    /// Check if this state allows transitions to another state
    pub fn can_transition_to(&self, target: WorkflowState) -> bool {
        use WorkflowState::*;

        match (self, target) {
            // Terminal states - no transitions
            (Completed, _) | (Error, _) => false,

            // Any live state may fail
            (_, Error) => true,

            (Idle, StageRunning) | (Idle, Completed) => true,

            // Empty step plan completes the stage right away
            (StageRunning, StepRunning) | (StageRunning, StepCompleted) => true,

            // Reflection may find the step already satisfied
            (StepRunning, BehaviorRunning) | (StepRunning, StepCompleted) => true,

            (BehaviorRunning, ActionRunning) => true,

            (ActionRunning, BehaviorRunning) | (ActionRunning, StepCompleted) => true,

            (StepCompleted, StepRunning)
            | (StepCompleted, StageRunning)
            | (StepCompleted, Completed) => true,

            _ => false,
        }
    }

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Error)
    }
}

/// One applied FSM transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: String,
    pub from: WorkflowState,
    pub to: WorkflowState,
    /// What caused it, e.g. `stage_generation`
    pub trigger: String,
    pub timestamp: DateTime<Utc>,
}

impl TransitionRecord {
    pub fn new(from: WorkflowState, to: WorkflowState, trigger: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from,
            to,
            trigger: trigger.into(),
            timestamp: Utc::now(),
        }
    }
}
