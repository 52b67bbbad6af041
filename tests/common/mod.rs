//! Shared test doubles: a scripted gateway and a canned executor
#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

use nbflow::action::ExecutionStep;
use nbflow::gateway::{ActionStream, Gateway, GatewayRequest, RequestKind};
use nbflow::{CodeExecutor, Error, Output, Result};

/// One scripted planning reply
pub enum Reply {
    Json(Value),
    /// Transient failure, retried by the controller
    Down,
}

/// One scripted generating reply
pub enum Actions {
    Steps(Vec<ExecutionStep>),
    /// Yields the steps, then breaks mid-stream
    Broken(Vec<ExecutionStep>),
    Down,
}

/// Gateway replaying canned replies in order
#[derive(Default)]
pub struct ScriptedGateway {
    plans: Mutex<VecDeque<Reply>>,
    actions: Mutex<VecDeque<Actions>>,
    requests: Mutex<Vec<GatewayRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(self, reply: Value) -> Self {
        self.plans.lock().unwrap().push_back(Reply::Json(reply));
        self
    }

    pub fn plan_down(self) -> Self {
        self.plans.lock().unwrap().push_back(Reply::Down);
        self
    }

    pub fn actions(self, steps: Vec<ExecutionStep>) -> Self {
        self.actions.lock().unwrap().push_back(Actions::Steps(steps));
        self
    }

    pub fn broken_actions(self, steps: Vec<ExecutionStep>) -> Self {
        self.actions.lock().unwrap().push_back(Actions::Broken(steps));
        self
    }

    pub fn actions_down(self) -> Self {
        self.actions.lock().unwrap().push_back(Actions::Down);
        self
    }

    /// Kinds of every request received, in order
    pub fn kinds(&self) -> Vec<RequestKind> {
        self.requests.lock().unwrap().iter().map(|r| r.kind).collect()
    }

    pub fn requests(&self) -> Vec<GatewayRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn generate_calls(&self) -> usize {
        self.kinds()
            .into_iter()
            .filter(|k| *k == RequestKind::ActionGeneration)
            .count()
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn plan(&self, request: &GatewayRequest) -> Result<Value> {
        self.requests.lock().unwrap().push(request.clone());
        match self.plans.lock().unwrap().pop_front() {
            Some(Reply::Json(value)) => Ok(value),
            Some(Reply::Down) => Err(Error::Connectivity("planner down".into())),
            None => Err(Error::Validation("script exhausted".into())),
        }
    }

    async fn generate(&self, request: &GatewayRequest) -> Result<ActionStream> {
        self.requests.lock().unwrap().push(request.clone());
        match self.actions.lock().unwrap().pop_front() {
            Some(Actions::Steps(steps)) => Ok(futures::stream::iter(steps.into_iter().map(Ok)).boxed()),
            Some(Actions::Broken(steps)) => {
                let items: Vec<Result<ExecutionStep>> = steps
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(Error::Connectivity(
                        "stream reset".into(),
                    ))))
                    .collect();
                Ok(futures::stream::iter(items).boxed())
            }
            Some(Actions::Down) => Err(Error::Connectivity("generator down".into())),
            None => Ok(futures::stream::empty().boxed()),
        }
    }
}

/// Executor returning canned output batches in order
#[derive(Default)]
pub struct FixedExecutor {
    batches: Mutex<VecDeque<Vec<Output>>>,
    executed: Mutex<Vec<String>>,
}

impl FixedExecutor {
    pub fn new(batches: Vec<Vec<Output>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeExecutor for FixedExecutor {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn execute(&self, code: &str) -> Result<Vec<Output>> {
        self.executed.lock().unwrap().push(code.to_string());
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }
}
