//! nbflow: Planner-driven notebook orchestration
//!
//! Drives a multi-stage process through a finite state machine. Plans come
//! from an external planner, actions from an external generator, and every
//! action leaves its trace in a notebook of cells and an evolving context.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        WorkflowController (FSM)         │
//! │  IDLE → STAGE → STEP → BEHAVIOR → ACTION│
//! └──────────┬───────────────────┬──────────┘
//!            ▼                   ▼
//! ┌────────────────────┐ ┌────────────────────┐
//! │  Planning gateway  │ │ Generating gateway │
//! │  → TransitionParser│ │ → ActionDispatcher │
//! │  → ProgressTracker │ │ → Notebook/Context │
//! └────────────────────┘ └────────────────────┘
//! ```
//!
//! Each workflow owns one [`WorkflowSession`] (notebook, context, progress).
//! Nothing is global; two sessions never share state.

pub mod action;
pub mod config;
pub mod context;
pub mod executor;
pub mod gateway;
pub mod notebook;
pub mod progress;
pub mod transition;
pub mod workflow;

// Re-exports for convenience
pub use action::{ActionDispatcher, ActionHandler, ActionOutcome, ExecutionStep};
pub use config::Config;
pub use context::{ContextStore, Effect};
pub use executor::{CodeExecutor, ProcessExecutor};
pub use gateway::{Gateway, HttpGateway, RetryPolicy};
pub use notebook::{Cell, CellType, NotebookStore, Output, OutputKind};
pub use progress::{PlanUnit, ProgressTier, ProgressTracker};
pub use transition::{PlanFragment, PlanKind, TransitionParser};
pub use workflow::{
    ExecutionControl, ExecutionStatus, PauseHandle, RunOutcome, StartMode, WorkflowController,
    WorkflowPosition, WorkflowSession, WorkflowState,
};

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or duplicate plan fragment. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient network or timeout failure talking to a gateway.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Retries against a gateway ran out.
    #[error("Connectivity error after {attempts} attempts: {message}")]
    ConnectivityExhausted { attempts: u32, message: String },

    /// A handler or the code executor reported a failure.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A pre/post hook failed.
    #[error("Hook error: {0}")]
    Hook(String),

    /// Transition not valid for the current state, or unknown action type.
    #[error("FSM error: {0}")]
    Fsm(String),

    #[error("Cell not found: {0}")]
    CellNotFound(String),

    /// A handler explicitly asked to stop the workflow.
    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether this error ends the workflow in `ERROR`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::ConnectivityExhausted { .. }
                | Error::Fatal(_)
                | Error::Config(_)
        )
    }

    /// Whether a gateway call that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connectivity(_) => true,
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Validation("missing id".into()).is_fatal());
        assert!(Error::ConnectivityExhausted {
            attempts: 3,
            message: "timeout".into()
        }
        .is_fatal());
        assert!(!Error::Connectivity("timeout".into()).is_fatal());
        assert!(!Error::Execution("boom".into()).is_fatal());
        assert!(!Error::Hook("boom".into()).is_fatal());
        assert!(!Error::Fsm("unknown action".into()).is_fatal());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Connectivity("reset".into()).is_retryable());
        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(!Error::ConnectivityExhausted {
            attempts: 2,
            message: "x".into()
        }
        .is_retryable());
    }
}
