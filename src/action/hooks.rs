//! Pre/post action hooks
//!
//! Hooks run in registration order. A hook that returns an error or panics
//! is logged and skipped: a pre-hook never stops its handler, a post-hook
//! never changes an outcome that was already committed.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::warn;

use super::{ActionOutcome, ExecutionStep};
use crate::workflow::WorkflowSession;
use crate::Result;

/// Runs before a handler
#[async_trait]
pub trait PreHook: Send + Sync {
    fn name(&self) -> &str;

    async fn before(&self, step: &ExecutionStep, session: &WorkflowSession) -> Result<()>;
}

/// Runs after a handler, observing its outcome
#[async_trait]
pub trait PostHook: Send + Sync {
    fn name(&self) -> &str;

    async fn after(
        &self,
        step: &ExecutionStep,
        outcome: &ActionOutcome,
        session: &WorkflowSession,
    ) -> Result<()>;
}

/// Ordered pre- and post-hook lists
#[derive(Default, Clone)]
pub struct HookChain {
    pre: Vec<Arc<dyn PreHook>>,
    post: Vec<Arc<dyn PostHook>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pre(&mut self, hook: Arc<dyn PreHook>) {
        self.pre.push(hook);
    }

    pub fn add_post(&mut self, hook: Arc<dyn PostHook>) {
        self.post.push(hook);
    }

    pub async fn run_pre(&self, step: &ExecutionStep, session: &WorkflowSession) {
        for hook in &self.pre {
            match AssertUnwindSafe(hook.before(step, session))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    hook = hook.name(),
                    action = %step.action_type,
                    "pre-hook failed: {}", e
                ),
                Err(_) => warn!(
                    hook = hook.name(),
                    action = %step.action_type,
                    "pre-hook panicked"
                ),
            }
        }
    }

    pub async fn run_post(
        &self,
        step: &ExecutionStep,
        outcome: &ActionOutcome,
        session: &WorkflowSession,
    ) {
        for hook in &self.post {
            match AssertUnwindSafe(hook.after(step, outcome, session))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    hook = hook.name(),
                    action = %step.action_type,
                    "post-hook failed: {}", e
                ),
                Err(_) => warn!(
                    hook = hook.name(),
                    action = %step.action_type,
                    "post-hook panicked"
                ),
            }
        }
    }
}

impl std::fmt::Debug for HookChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pre: Vec<&str> = self.pre.iter().map(|h| h.name()).collect();
        let post: Vec<&str> = self.post.iter().map(|h| h.name()).collect();
        f.debug_struct("HookChain")
            .field("pre", &pre)
            .field("post", &post)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl PreHook for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        async fn before(&self, step: &ExecutionStep, _session: &WorkflowSession) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.label, step.action_type));
            if self.fail {
                return Err(Error::Hook(format!("{} refused", self.label)));
            }
            Ok(())
        }
    }

    struct Panicker;

    #[async_trait]
    impl PreHook for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }

        async fn before(&self, _step: &ExecutionStep, _session: &WorkflowSession) -> Result<()> {
            panic!("hook blew up");
        }
    }

    #[tokio::test]
    async fn test_pre_hooks_run_in_order_despite_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = HookChain::new();
        chain.add_pre(Arc::new(Recorder {
            label: "first",
            log: log.clone(),
            fail: true,
        }));
        chain.add_pre(Arc::new(Panicker));
        chain.add_pre(Arc::new(Recorder {
            label: "third",
            log: log.clone(),
            fail: false,
        }));

        let session = WorkflowSession::new();
        chain.run_pre(&ExecutionStep::new("add-cell"), &session).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:add-cell".to_string(), "third:add-cell".to_string()]
        );
    }
}
