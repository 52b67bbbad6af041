//! Execution control: step ceiling, start mode, pause flag

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::WorkflowState;
use crate::{Error, Result};

/// How behavior arrangement treats the first round of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// Always generate at least one behavior per step
    #[default]
    Generation,
    /// Let the planner declare a step already achieved before generating
    Reflection,
}

impl fmt::Display for StartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartMode::Generation => write!(f, "generation"),
            StartMode::Reflection => write!(f, "reflection"),
        }
    }
}

impl std::str::FromStr for StartMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "generation" => Ok(StartMode::Generation),
            "reflection" => Ok(StartMode::Reflection),
            _ => Err(Error::Config(format!("Unknown start mode: {}", s))),
        }
    }
}

/// Step-ceiling bookkeeping for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionControl {
    /// Actions dispatched since start (or since the last re-arm)
    pub step_counter: u64,
    /// 0 means unbounded
    pub max_steps: u64,
    pub start_mode: StartMode,
    /// Pause at the ceiling instead of stopping
    pub interactive: bool,
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new(0, StartMode::Generation, false)
    }
}

impl ExecutionControl {
    pub fn new(max_steps: u64, start_mode: StartMode, interactive: bool) -> Self {
        Self {
            step_counter: 0,
            max_steps,
            start_mode,
            interactive,
        }
    }

    pub fn ceiling_reached(&self) -> bool {
        self.max_steps > 0 && self.step_counter >= self.max_steps
    }

    /// Count one dispatched action
    pub fn record_step(&mut self) {
        self.step_counter += 1;
    }
}

/// Shared pause flag, cloneable into signal handlers and other tasks
#[derive(Debug, Clone, Default)]
pub struct PauseHandle {
    paused: Arc<AtomicBool>,
    quit: Arc<AtomicBool>,
}

impl PauseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Workflow paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Workflow resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Ask the embedding program to stop; the controller itself only pauses
    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.pause();
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Handle one interrupt: the first pauses, one while paused requests quit
    pub fn interrupt(&self) {
        if self.paused.swap(true, Ordering::SeqCst) {
            debug!("Interrupt while paused, requesting quit");
            self.quit.store(true, Ordering::SeqCst);
        }
    }

    /// Route Ctrl+C to [`interrupt`](Self::interrupt)
    pub fn install_ctrlc(&self) -> Result<()> {
        let handle = self.clone();
        ctrlc::set_handler(move || {
            handle.interrupt();
            if handle.quit_requested() {
                eprintln!("\nQuitting.");
            } else {
                eprintln!("\nPausing after the current call. Ctrl+C again to quit.");
            }
        })
        .map_err(|e| Error::Config(format!("Failed to set signal handler: {}", e)))
    }
}

/// Where the workflow currently is
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPosition {
    pub stage_id: Option<String>,
    pub step_id: Option<String>,
    pub behavior_id: Option<String>,
    /// Behaviors started within the current step
    pub behavior_iteration: u32,
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub state: WorkflowState,
    pub position: WorkflowPosition,
    pub step_counter: u64,
    pub max_steps: u64,
    pub start_mode: StartMode,
    pub interactive: bool,
    pub paused: bool,
    /// Action type being or last dispatched
    pub current_action: Option<String>,
    pub last_error: Option<String>,
}

/// Why [`run`](super::WorkflowController::run) returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed { message: String },
    Paused,
    /// Non-interactive step ceiling hit; state is kept as is
    StepLimitReached,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling() {
        let mut control = ExecutionControl::new(2, StartMode::Generation, false);
        assert!(!control.ceiling_reached());
        control.record_step();
        control.record_step();
        assert!(control.ceiling_reached());

        let mut unbounded = ExecutionControl::default();
        for _ in 0..1000 {
            unbounded.record_step();
        }
        assert!(!unbounded.ceiling_reached());
    }

    #[test]
    fn test_pause_handle_shared() {
        let handle = PauseHandle::new();
        let clone = handle.clone();
        clone.pause();
        assert!(handle.is_paused());
        handle.resume();
        assert!(!clone.is_paused());
    }

    #[test]
    fn test_second_interrupt_requests_quit() {
        let handle = PauseHandle::new();
        handle.interrupt();
        assert!(handle.is_paused());
        assert!(!handle.quit_requested());

        handle.interrupt();
        assert!(handle.quit_requested());

        let fresh = PauseHandle::new();
        fresh.request_quit();
        assert!(fresh.is_paused());
        assert!(fresh.quit_requested());
    }

    #[test]
    fn test_start_mode_parse() {
        assert_eq!("Reflection".parse::<StartMode>().unwrap(), StartMode::Reflection);
        assert!("later".parse::<StartMode>().is_err());
        assert_eq!(StartMode::default(), StartMode::Generation);
    }
}
