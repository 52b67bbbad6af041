//! Workflow FSM, session, and execution control

mod control;
mod controller;
mod session;
mod state;

pub use control::{
    ExecutionControl, ExecutionStatus, PauseHandle, RunOutcome, StartMode, WorkflowPosition,
};
pub use controller::WorkflowController;
pub use session::WorkflowSession;
pub use state::{TransitionRecord, WorkflowState};
