//! Workflow controller
//!
//! Owns one [`WorkflowSession`] and drives it through the FSM one
//! transition at a time. Each transition is a single planning call, a
//! single generating call, or a single action dispatch, so there is never
//! more than one outstanding external call.

use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::control::{ExecutionControl, ExecutionStatus, PauseHandle, RunOutcome, StartMode, WorkflowPosition};
use super::session::WorkflowSession;
use super::state::{TransitionRecord, WorkflowState};
use crate::action::{ActionContext, ActionDispatcher, ActionOutcome};
use crate::executor::CodeExecutor;
use crate::gateway::{ActionStream, Gateway, GatewayRequest, RequestKind, RetryPolicy};
use crate::transition::{Applied, PlanKind, TransitionParser};
use crate::{Error, Result};

/// Drives a session from IDLE to COMPLETED (or ERROR)
pub struct WorkflowController {
    session: WorkflowSession,
    gateway: Arc<dyn Gateway>,
    dispatcher: ActionDispatcher,
    executor: Option<Arc<dyn CodeExecutor>>,
    parser: TransitionParser,
    retry: RetryPolicy,
    state: WorkflowState,
    control: ExecutionControl,
    pause: PauseHandle,
    /// Actions of the running behavior not yet dispatched
    pending: Option<ActionStream>,
    /// A `complete-step` action was seen in the current batch
    step_satisfied: bool,
    behavior_iteration: u32,
    current_action: Option<String>,
    transitions: Vec<TransitionRecord>,
    last_error: Option<String>,
    seed_variables: HashMap<String, Value>,
    custom_context: Map<String, Value>,
}

impl WorkflowController {
    /// Controller with the built-in actions, no executor, default retry
    /// policy, and unbounded steps
    pub fn new(session: WorkflowSession, gateway: Arc<dyn Gateway>) -> Self {
        let seed_variables = session.context.variables().clone();
        let custom_context = session.context.custom_context().clone();
        Self {
            session,
            gateway,
            dispatcher: ActionDispatcher::with_defaults(),
            executor: None,
            parser: TransitionParser::new(),
            retry: RetryPolicy::default(),
            state: WorkflowState::Idle,
            control: ExecutionControl::default(),
            pause: PauseHandle::new(),
            pending: None,
            step_satisfied: false,
            behavior_iteration: 0,
            current_action: None,
            transitions: Vec::new(),
            last_error: None,
            seed_variables,
            custom_context,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: ActionDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_control(mut self, control: ExecutionControl) -> Self {
        self.control = control;
        self
    }

    /// Overlay merged into the context now and after every reset
    pub fn with_custom_context(mut self, overlay: Map<String, Value>) -> Self {
        self.session.context.merge_custom_context(overlay.clone());
        self.custom_context.extend(overlay);
        self
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn session(&self) -> &WorkflowSession {
        &self.session
    }

    pub fn dispatcher_mut(&mut self) -> &mut ActionDispatcher {
        &mut self.dispatcher
    }

    pub fn control(&self) -> &ExecutionControl {
        &self.control
    }

    pub fn transition_history(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Handle for pausing from another task or a signal handler
    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    pub fn pause(&self) {
        self.pause.pause();
    }

    /// Clear the pause flag. In interactive mode a reached ceiling is
    /// re-armed so another `max_steps` actions may run.
    pub fn resume(&mut self) {
        if self.control.interactive && self.control.ceiling_reached() {
            debug!("Re-arming step ceiling of {}", self.control.max_steps);
            self.control.step_counter = 0;
        }
        self.pause.resume();
    }

    pub fn position(&self) -> WorkflowPosition {
        let progress = &self.session.progress;
        WorkflowPosition {
            stage_id: progress.current_stage_id().map(str::to_string),
            step_id: progress.current_step_id().map(str::to_string),
            behavior_id: progress.current_behavior_id().map(str::to_string),
            behavior_iteration: self.behavior_iteration,
        }
    }

    pub fn execution_status(&self) -> ExecutionStatus {
        ExecutionStatus {
            state: self.state,
            position: self.position(),
            step_counter: self.control.step_counter,
            max_steps: self.control.max_steps,
            start_mode: self.control.start_mode,
            interactive: self.control.interactive,
            paused: self.pause.is_paused(),
            current_action: self.current_action.clone(),
            last_error: self.last_error.clone(),
        }
    }

    /// Tear the session down and start over from IDLE
    pub fn reset(&mut self) {
        info!("Resetting workflow session {}", self.session.id);
        self.session
            .reset(self.seed_variables.clone(), self.custom_context.clone());
        self.state = WorkflowState::Idle;
        self.control.step_counter = 0;
        self.pending = None;
        self.step_satisfied = false;
        self.behavior_iteration = 0;
        self.current_action = None;
        self.transitions.clear();
        self.last_error = None;
        self.pause.resume();
    }

    /// Advance until completion, failure, a pause, or the step ceiling
    pub async fn run(&mut self) -> RunOutcome {
        loop {
            match self.state {
                WorkflowState::Completed => return RunOutcome::Completed,
                WorkflowState::Error => {
                    return RunOutcome::Failed {
                        message: self.last_error.clone().unwrap_or_default(),
                    }
                }
                _ => {}
            }

            if self.pause.is_paused() {
                return RunOutcome::Paused;
            }

            if self.control.ceiling_reached() {
                if self.control.interactive {
                    self.pause.pause();
                    return RunOutcome::Paused;
                }
                info!(
                    "Step ceiling of {} reached in {}",
                    self.control.max_steps, self.state
                );
                return RunOutcome::StepLimitReached;
            }

            // Failures are reflected in `state`, checked at the top
            let _ = self.advance().await;
        }
    }

    /// Perform exactly one transition (or one action dispatch).
    ///
    /// A no-op while paused or at the step ceiling. Fatal failures move
    /// the FSM to ERROR and are returned.
    pub async fn advance(&mut self) -> Result<WorkflowState> {
        if self.state.is_terminal() {
            return Err(Error::Fsm(format!("Workflow already {}", self.state)));
        }
        if self.pause.is_paused() {
            debug!("Paused, not advancing from {}", self.state);
            return Ok(self.state);
        }
        if self.control.ceiling_reached() {
            debug!("Step ceiling reached, not advancing from {}", self.state);
            return Ok(self.state);
        }

        let result = match self.state {
            WorkflowState::Idle => self.plan_stages().await,
            WorkflowState::StageRunning => self.plan_steps().await,
            WorkflowState::StepRunning => self.arrange_behavior().await,
            WorkflowState::BehaviorRunning => self.generate_actions().await,
            WorkflowState::ActionRunning => self.next_action().await,
            WorkflowState::StepCompleted => self.complete_step(),
            WorkflowState::Error | WorkflowState::Completed => Ok(()),
        };

        match result {
            Ok(()) => Ok(self.state),
            Err(Error::Fsm(message)) => {
                warn!("Skipped: {}", message);
                Ok(self.state)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn transition(&mut self, to: WorkflowState, trigger: &str) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::Fsm(format!(
                "Invalid transition {} -> {} ({})",
                self.state, to, trigger
            )));
        }
        info!("{} -> {} ({})", self.state, to, trigger);
        self.transitions
            .push(TransitionRecord::new(self.state, to, trigger));
        self.state = to;
        Ok(())
    }

    fn fail(&mut self, e: &Error) {
        error!("Workflow failed in {}: {}", self.state, e);
        self.pending = None;
        self.last_error = Some(e.to_string());
        if let Err(fsm) = self.transition(WorkflowState::Error, "fatal_error") {
            warn!("{}", fsm);
        }
    }

    fn request(&self, kind: RequestKind, reflection: bool) -> GatewayRequest {
        GatewayRequest::build(
            kind,
            &self.session,
            self.state,
            self.transitions.last().cloned(),
            reflection,
        )
    }

    async fn plan(&self, kind: RequestKind, reflection: bool) -> Result<Value> {
        let request = self.request(kind, reflection);
        let gateway = &self.gateway;
        self.retry
            .run(&format!("Planning ({})", kind), || gateway.plan(&request))
            .await
            .map_err(|e| self.gateway_error(e))
    }

    /// `Fsm` means a skipped local transition. From the gateway it ends the run.
    fn gateway_error(&self, e: Error) -> Error {
        match e {
            Error::Fsm(message) => Error::Fatal(format!(
                "Gateway {} reported: {}",
                self.gateway.name(),
                message
            )),
            other => other,
        }
    }

    async fn plan_stages(&mut self) -> Result<()> {
        let response = self.plan(RequestKind::StageGeneration, false).await?;
        self.parser.apply(
            &response,
            PlanKind::Stages,
            &mut self.session.progress,
            false,
        )?;

        if self.session.progress.stages.current().is_none() {
            return self.transition(WorkflowState::Completed, "stage_generation_empty");
        }
        self.transition(WorkflowState::StageRunning, "stage_generation")
    }

    async fn plan_steps(&mut self) -> Result<()> {
        let response = self.plan(RequestKind::StepGeneration, false).await?;
        self.parser.apply(
            &response,
            PlanKind::Steps,
            &mut self.session.progress,
            false,
        )?;

        if self.session.progress.steps.current().is_none() {
            return self.transition(WorkflowState::StepCompleted, "step_generation_empty");
        }
        self.behavior_iteration = 0;
        self.transition(WorkflowState::StepRunning, "step_generation")
    }

    /// A "target achieved" verdict counts in reflection mode, and in any
    /// mode once the step has had at least one round of actions.
    fn honor_achieved(&self) -> bool {
        self.control.start_mode == StartMode::Reflection || self.behavior_iteration > 0
    }

    async fn arrange_behavior(&mut self) -> Result<()> {
        let honor = self.honor_achieved();
        let response = self
            .plan(RequestKind::BehaviorArrangement, honor)
            .await?;

        match self.parser.apply(
            &response,
            PlanKind::Behavior,
            &mut self.session.progress,
            honor,
        )? {
            Applied::TargetAchieved => {
                self.transition(WorkflowState::StepCompleted, "target_achieved")
            }
            Applied::Behavior { id } => {
                self.session.context.begin_iteration();
                self.behavior_iteration += 1;
                debug!("Behavior {} (iteration {})", id, self.behavior_iteration);
                self.transition(WorkflowState::BehaviorRunning, "behavior_arrangement")
            }
            Applied::Planned { kind, .. } => Err(Error::Validation(format!(
                "Expected a behavior, got a {} plan",
                kind
            ))),
        }
    }

    async fn generate_actions(&mut self) -> Result<()> {
        let request = self.request(RequestKind::ActionGeneration, false);
        let gateway = &self.gateway;
        let stream = self
            .retry
            .run("Generating", || gateway.generate(&request))
            .await
            .map_err(|e| self.gateway_error(e))?;

        self.pending = Some(stream);
        self.step_satisfied = false;
        self.transition(WorkflowState::ActionRunning, "action_generation")
    }

    async fn next_action(&mut self) -> Result<()> {
        let next = match self.pending.as_mut() {
            Some(stream) => stream.next().await,
            None => None,
        };

        match next {
            Some(Ok(step)) => {
                self.current_action = Some(step.action_type.clone());
                let executor = self.executor.as_deref();
                let mut ctx = ActionContext::new(&mut self.session, executor);
                let outcome = self.dispatcher.dispatch(&step, &mut ctx).await?;

                self.control.record_step();
                if outcome == ActionOutcome::StepSatisfied {
                    self.step_satisfied = true;
                }

                if self.control.interactive && self.control.ceiling_reached() {
                    info!(
                        "Step ceiling of {} reached, pausing",
                        self.control.max_steps
                    );
                    self.pause.pause();
                }
                Ok(())
            }
            // The stream cannot be restarted, so a broken one ends the run
            Some(Err(e)) => Err(self.gateway_error(e)),
            None => {
                self.pending = None;
                if self.step_satisfied {
                    self.transition(WorkflowState::StepCompleted, "step_satisfied")
                } else {
                    self.arrange_behavior().await
                }
            }
        }
    }

    fn complete_step(&mut self) -> Result<()> {
        let progress = &mut self.session.progress;
        progress.behaviors.complete_current();
        if let Some(step) = progress.steps.complete_current() {
            info!("Step {} completed", step.id);
        }
        self.behavior_iteration = 0;

        if progress.steps.promote_next() {
            progress.enter_step();
            return self.transition(WorkflowState::StepRunning, "next_step");
        }

        if let Some(stage) = progress.stages.complete_current() {
            info!("Stage {} completed", stage.id);
        }
        if progress.stages.promote_next() {
            progress.enter_stage();
            return self.transition(WorkflowState::StageRunning, "next_stage");
        }

        self.transition(WorkflowState::Completed, "all_stages_done")
    }
}

impl std::fmt::Debug for WorkflowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowController")
            .field("session", &self.session.id)
            .field("gateway", &self.gateway.name())
            .field("state", &self.state)
            .field("control", &self.control)
            .field("paused", &self.pause.is_paused())
            .finish()
    }
}
