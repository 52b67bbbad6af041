//! Built-in action handlers
//!
//! | action type     | effect                                               |
//! |-----------------|------------------------------------------------------|
//! | `add-cell`      | append a text or code cell (`cell_type` metadata)    |
//! | `add-text`      | append a text cell                                   |
//! | `add-code`      | append a code cell                                   |
//! | `execute-code`  | run a code cell through the executor                 |
//! | `new-chapter`   | append a chapter marker cell                         |
//! | `new-section`   | append a section marker cell                         |
//! | `clear-outputs` | empty a cell's outputs                               |
//! | `update-cell`   | replace a cell's content and/or type                 |
//! | `delete-cell`   | remove a cell                                        |
//! | `set-variable`  | write a context variable                             |
//! | `push-todo`     | queue a todo item                                    |
//! | `complete-step` | report the current step's criteria satisfied         |

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use super::{ActionContext, ActionDispatcher, ActionHandler, ActionOutcome, ExecutionStep};
use crate::context::Effect;
use crate::notebook::{CellType, CellUpdate, Output};
use crate::{Error, Result};

pub const ADD_CELL: &str = "add-cell";
pub const ADD_TEXT: &str = "add-text";
pub const ADD_CODE: &str = "add-code";
pub const EXECUTE_CODE: &str = "execute-code";
pub const NEW_CHAPTER: &str = "new-chapter";
pub const NEW_SECTION: &str = "new-section";
pub const CLEAR_OUTPUTS: &str = "clear-outputs";
pub const UPDATE_CELL: &str = "update-cell";
pub const DELETE_CELL: &str = "delete-cell";
pub const SET_VARIABLE: &str = "set-variable";
pub const PUSH_TODO: &str = "push-todo";
pub const COMPLETE_STEP: &str = "complete-step";

/// Register every built-in handler
pub fn register_defaults(dispatcher: &mut ActionDispatcher) {
    dispatcher.register(ADD_CELL, Arc::new(AddCell { cell_type: None }));
    dispatcher.register(
        ADD_TEXT,
        Arc::new(AddCell {
            cell_type: Some(CellType::Text),
        }),
    );
    dispatcher.register(
        ADD_CODE,
        Arc::new(AddCell {
            cell_type: Some(CellType::Code),
        }),
    );
    dispatcher.register(EXECUTE_CODE, Arc::new(ExecuteCode));
    dispatcher.register(NEW_CHAPTER, Arc::new(Marker::Chapter));
    dispatcher.register(NEW_SECTION, Arc::new(Marker::Section));
    dispatcher.register(CLEAR_OUTPUTS, Arc::new(ClearOutputs));
    dispatcher.register(UPDATE_CELL, Arc::new(UpdateCell));
    dispatcher.register(DELETE_CELL, Arc::new(DeleteCell));
    dispatcher.register(SET_VARIABLE, Arc::new(SetVariable));
    dispatcher.register(PUSH_TODO, Arc::new(PushTodo));
    dispatcher.register(COMPLETE_STEP, Arc::new(CompleteStep));
}

fn requested_cell_type(step: &ExecutionStep) -> Result<Option<CellType>> {
    step.meta_str("cell_type")
        .or_else(|| step.meta_str("type"))
        .map(str::parse)
        .transpose()
}

/// Appends a cell at the end of the notebook
pub struct AddCell {
    /// Fixed type; `None` reads `cell_type` from the step (default text)
    pub cell_type: Option<CellType>,
}

#[async_trait]
impl ActionHandler for AddCell {
    async fn handle(
        &self,
        step: &ExecutionStep,
        ctx: &mut ActionContext<'_>,
    ) -> Result<ActionOutcome> {
        let cell_type = match self.cell_type {
            Some(t) => t,
            None => requested_cell_type(step)?.unwrap_or(CellType::Text),
        };
        let content = step.content.clone().unwrap_or_default();
        let id = ctx.session.notebook.add_cell(cell_type, content);
        debug!("Added {} cell {}", cell_type, id);
        Ok(ActionOutcome::cell(id))
    }
}

/// Runs a code cell through the configured executor
pub struct ExecuteCode;

#[async_trait]
impl ActionHandler for ExecuteCode {
    async fn handle(
        &self,
        step: &ExecutionStep,
        ctx: &mut ActionContext<'_>,
    ) -> Result<ActionOutcome> {
        let Some(executor) = ctx.executor else {
            debug!("No code executor configured, skipping execution");
            return Ok(ActionOutcome::NoResult);
        };

        let cell_id = ctx.session.notebook.resolve(step.target.as_deref())?;
        let code = {
            let cell = ctx
                .session
                .notebook
                .get_cell(&cell_id)
                .ok_or_else(|| Error::CellNotFound(cell_id.clone()))?;
            if cell.cell_type != CellType::Code {
                return Err(Error::Execution(format!(
                    "Cell {} is a {} cell, not code",
                    cell_id, cell.cell_type
                )));
            }
            cell.content.clone()
        };

        ctx.session.notebook.clear_outputs(&cell_id)?;

        let outputs = match executor.execute(&code).await {
            Ok(outputs) => outputs,
            Err(e) => vec![Output::failure(e.to_string())],
        };

        for output in &outputs {
            ctx.session.notebook.append_output(&cell_id, output.clone())?;
            ctx.session.context.append_effect(Effect::new(
                Some(cell_id.clone()),
                &step.action_type,
                output.clone(),
            ));
        }

        Ok(ActionOutcome::Applied {
            cell_id: Some(cell_id),
            outputs,
        })
    }
}

/// Non-executable structural marker
pub enum Marker {
    Chapter,
    Section,
}

#[async_trait]
impl ActionHandler for Marker {
    async fn handle(
        &self,
        step: &ExecutionStep,
        ctx: &mut ActionContext<'_>,
    ) -> Result<ActionOutcome> {
        let (kind, heading) = match self {
            Marker::Chapter => ("chapter", "#"),
            Marker::Section => ("section", "##"),
        };
        let title = step.content.as_deref().unwrap_or("").trim();

        let mut metadata = Map::new();
        metadata.insert("marker".to_string(), Value::String(kind.to_string()));

        let id = ctx.session.notebook.add_cell_with_metadata(
            CellType::Text,
            format!("{} {}", heading, title).trim_end().to_string(),
            metadata,
        );
        Ok(ActionOutcome::cell(id))
    }
}

/// Empties a cell's outputs without running it
pub struct ClearOutputs;

#[async_trait]
impl ActionHandler for ClearOutputs {
    async fn handle(
        &self,
        step: &ExecutionStep,
        ctx: &mut ActionContext<'_>,
    ) -> Result<ActionOutcome> {
        let cell_id = ctx.session.notebook.resolve(step.target.as_deref())?;
        ctx.session.notebook.clear_outputs(&cell_id)?;
        Ok(ActionOutcome::cell(cell_id))
    }
}

/// Replaces content and/or type of a cell
pub struct UpdateCell;

#[async_trait]
impl ActionHandler for UpdateCell {
    async fn handle(
        &self,
        step: &ExecutionStep,
        ctx: &mut ActionContext<'_>,
    ) -> Result<ActionOutcome> {
        let cell_id = ctx.session.notebook.resolve(step.target.as_deref())?;
        let update = CellUpdate {
            content: step.content.clone(),
            cell_type: requested_cell_type(step)?,
            metadata: None,
        };
        ctx.session.notebook.update_cell(&cell_id, update)?;
        Ok(ActionOutcome::cell(cell_id))
    }
}

/// Removes a cell
pub struct DeleteCell;

#[async_trait]
impl ActionHandler for DeleteCell {
    async fn handle(
        &self,
        step: &ExecutionStep,
        ctx: &mut ActionContext<'_>,
    ) -> Result<ActionOutcome> {
        let target = step
            .target
            .as_deref()
            .ok_or_else(|| Error::Execution("delete-cell needs an explicit target".to_string()))?;
        let cell_id = ctx.session.notebook.resolve(Some(target))?;
        ctx.session.notebook.delete_cell(&cell_id)?;
        Ok(ActionOutcome::cell(cell_id))
    }
}

/// Writes `name` = `value` (or the content) into the context
pub struct SetVariable;

#[async_trait]
impl ActionHandler for SetVariable {
    async fn handle(
        &self,
        step: &ExecutionStep,
        ctx: &mut ActionContext<'_>,
    ) -> Result<ActionOutcome> {
        let name = step
            .meta_str("name")
            .or(step.target.as_deref())
            .ok_or_else(|| Error::Execution("set-variable needs a name".to_string()))?
            .to_string();
        let value = step
            .metadata
            .get("value")
            .cloned()
            .or_else(|| step.content.clone().map(Value::String))
            .unwrap_or(Value::Null);

        ctx.session.context.set_variable(name, value);
        Ok(ActionOutcome::Applied {
            cell_id: None,
            outputs: Vec::new(),
        })
    }
}

/// Queues a todo item
pub struct PushTodo;

#[async_trait]
impl ActionHandler for PushTodo {
    async fn handle(
        &self,
        step: &ExecutionStep,
        ctx: &mut ActionContext<'_>,
    ) -> Result<ActionOutcome> {
        let item = step
            .content
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::Execution("push-todo needs content".to_string()))?;
        ctx.session.context.push_todo(item);
        Ok(ActionOutcome::Applied {
            cell_id: None,
            outputs: Vec::new(),
        })
    }
}

/// Reports the current step's acceptance criteria satisfied
pub struct CompleteStep;

#[async_trait]
impl ActionHandler for CompleteStep {
    async fn handle(
        &self,
        _step: &ExecutionStep,
        _ctx: &mut ActionContext<'_>,
    ) -> Result<ActionOutcome> {
        Ok(ActionOutcome::StepSatisfied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowSession;
    use serde_json::json;

    async fn run(step: ExecutionStep, session: &mut WorkflowSession) -> ActionOutcome {
        let dispatcher = ActionDispatcher::with_defaults();
        let mut ctx = ActionContext::new(session, None);
        dispatcher.dispatch(&step, &mut ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_add_cell_types() {
        let mut session = WorkflowSession::new();
        run(ExecutionStep::new(ADD_CELL).with_content("intro"), &mut session).await;
        run(
            ExecutionStep::new(ADD_CELL)
                .with_meta("cell_type", json!("code"))
                .with_content("x = 1"),
            &mut session,
        )
        .await;
        run(ExecutionStep::new(ADD_CODE).with_content("y = 2"), &mut session).await;

        let cells = session.notebook.cells();
        assert_eq!(cells[0].cell_type, CellType::Text);
        assert_eq!(cells[1].cell_type, CellType::Code);
        assert_eq!(cells[2].cell_type, CellType::Code);
        assert_eq!(session.notebook.last_added(), Some("c3"));
    }

    #[tokio::test]
    async fn test_markers_leave_effects_alone() {
        let mut session = WorkflowSession::new();
        run(ExecutionStep::new(NEW_CHAPTER).with_content("Analysis"), &mut session).await;
        run(ExecutionStep::new(NEW_SECTION).with_content("Cleaning"), &mut session).await;

        let cells = session.notebook.cells();
        assert_eq!(cells[0].content, "# Analysis");
        assert_eq!(cells[0].marker(), Some("chapter"));
        assert_eq!(cells[1].content, "## Cleaning");
        assert_eq!(cells[1].marker(), Some("section"));
        assert!(cells.iter().all(|c| c.outputs.is_empty()));
        assert!(session.context.effects().history.is_empty());
    }

    #[tokio::test]
    async fn test_execute_without_executor_is_no_result() {
        let mut session = WorkflowSession::new();
        run(ExecutionStep::new(ADD_CODE).with_content("print(1)"), &mut session).await;
        let outcome = run(
            ExecutionStep::new(EXECUTE_CODE).with_target("last-added-cell"),
            &mut session,
        )
        .await;

        assert_eq!(outcome, ActionOutcome::NoResult);
        assert!(session.notebook.cells()[0].outputs.is_empty());
        assert!(session.context.effects().history.is_empty());
    }

    #[tokio::test]
    async fn test_variables_and_todos() {
        let mut session = WorkflowSession::new();
        run(
            ExecutionStep::new(SET_VARIABLE)
                .with_meta("name", json!("rows"))
                .with_meta("value", json!(891)),
            &mut session,
        )
        .await;
        run(ExecutionStep::new(PUSH_TODO).with_content("plot survival"), &mut session).await;

        assert_eq!(session.context.get_variable("rows"), Some(&json!(891)));
        assert_eq!(session.context.pop_todo().as_deref(), Some("plot survival"));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let mut session = WorkflowSession::new();
        run(ExecutionStep::new(ADD_TEXT).with_content("draft"), &mut session).await;
        run(
            ExecutionStep::new(UPDATE_CELL)
                .with_target("c1")
                .with_content("final"),
            &mut session,
        )
        .await;
        assert_eq!(session.notebook.get_cell("c1").unwrap().content, "final");

        let outcome = run(ExecutionStep::new(DELETE_CELL), &mut session).await;
        assert!(matches!(outcome, ActionOutcome::Failed { .. }));
        assert_eq!(session.notebook.len(), 1);

        run(ExecutionStep::new(DELETE_CELL).with_target("c1"), &mut session).await;
        assert!(session.notebook.is_empty());
    }

    #[tokio::test]
    async fn test_complete_step() {
        let mut session = WorkflowSession::new();
        let outcome = run(ExecutionStep::new(COMPLETE_STEP), &mut session).await;
        assert_eq!(outcome, ActionOutcome::StepSatisfied);
    }
}
