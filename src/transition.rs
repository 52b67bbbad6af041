//! Transition parser
//!
//! Decodes planner responses into stage lists, step lists, or a single
//! behavior, then merges them into the [`ProgressTracker`]. Decoding and
//! merging are both all-or-nothing: a rejected fragment leaves the tracker
//! exactly as it was.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::OnceLock;
use tracing::debug;

use crate::progress::{Behavior, PlanUnit, ProgressTracker, Stage, Step, TierNotes};
use crate::{Error, Result};

/// What the planner was asked to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// Stage generation
    Stages,
    /// Step generation for the current stage
    Steps,
    /// Behavior arrangement for the current step
    Behavior,
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanKind::Stages => write!(f, "stages"),
            PlanKind::Steps => write!(f, "steps"),
            PlanKind::Behavior => write!(f, "behavior"),
        }
    }
}

/// A decoded planner response
#[derive(Debug, Clone, PartialEq)]
pub enum PlanFragment {
    Stages {
        stages: Vec<Stage>,
        notes: TierNotes,
    },
    Steps {
        steps: Vec<Step>,
        notes: TierNotes,
    },
    Behavior {
        behavior: Option<Behavior>,
        /// Planner's opaque "target already achieved" verdict
        target_achieved: bool,
        notes: TierNotes,
    },
}

/// Result of merging a fragment
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Entries appended to the stage or step tier
    Planned { kind: PlanKind, count: usize },
    /// A behavior became current
    Behavior { id: String },
    /// The planner reported the step target achieved; nothing merged
    TargetAchieved,
}

/// Wire shape of one planned unit before validation
#[derive(Debug, Deserialize)]
struct RawUnit {
    #[serde(default, alias = "stage_id", alias = "step_id", alias = "behavior_id")]
    id: Option<Value>,
    #[serde(default, alias = "name")]
    title: Option<String>,
    #[serde(default, alias = "description")]
    goal: Option<String>,
    #[serde(default, alias = "requirements", alias = "inputs")]
    required_inputs: Vec<Value>,
    #[serde(default, alias = "artifacts", alias = "outputs")]
    produced_artifacts: Vec<Value>,
    #[serde(default, alias = "acceptance")]
    acceptance_criteria: Vec<Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Nested fields may be plain strings or objects; objects are kept as JSON text
fn flatten_refs(values: Vec<Value>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| match v {
            Value::String(s) => s,
            Value::Object(ref obj) => obj
                .get("name")
                .or_else(|| obj.get("id"))
                .and_then(|n| n.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| v.to_string()),
            other => other.to_string(),
        })
        .collect()
}

impl RawUnit {
    fn validate(self, kind: PlanKind, index: usize) -> Result<PlanUnit> {
        let id = match self.id {
            Some(Value::String(s)) if !s.trim().is_empty() => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(Error::Validation(format!(
                    "{} entry {} has no id",
                    kind, index
                )))
            }
        };
        let title = match self.title {
            Some(t) if !t.trim().is_empty() => t,
            _ => {
                return Err(Error::Validation(format!(
                    "{} entry '{}' has no title",
                    kind, id
                )))
            }
        };

        Ok(PlanUnit {
            id,
            title,
            goal: self.goal.unwrap_or_default(),
            required_inputs: flatten_refs(self.required_inputs),
            produced_artifacts: flatten_refs(self.produced_artifacts),
            acceptance_criteria: flatten_refs(self.acceptance_criteria),
            extra: self.extra,
        })
    }
}

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("fence pattern is valid")
    })
}

/// Stateless decoder for planner responses
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionParser;

impl TransitionParser {
    pub fn new() -> Self {
        Self
    }

    /// Decode a planner response without touching any tracker
    pub fn parse(&self, response: &Value, kind: PlanKind) -> Result<PlanFragment> {
        let response = normalize(response)?;
        let notes = extract_notes(&response);

        match kind {
            PlanKind::Stages | PlanKind::Steps => {
                let key = if kind == PlanKind::Stages { "stages" } else { "steps" };
                let list = match &response {
                    Value::Array(items) => items.clone(),
                    Value::Object(obj) => match obj.get(key) {
                        Some(Value::Array(items)) => items.clone(),
                        _ => {
                            return Err(Error::Validation(format!(
                                "Planner response has no '{}' list",
                                key
                            )))
                        }
                    },
                    _ => {
                        return Err(Error::Validation(format!(
                            "Planner response for {} is not an object or array",
                            kind
                        )))
                    }
                };

                let units = list
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| decode_unit(item, kind, i))
                    .collect::<Result<Vec<_>>>()?;

                Ok(if kind == PlanKind::Stages {
                    PlanFragment::Stages {
                        stages: units,
                        notes,
                    }
                } else {
                    PlanFragment::Steps {
                        steps: units,
                        notes,
                    }
                })
            }
            PlanKind::Behavior => {
                let obj = response.as_object().ok_or_else(|| {
                    Error::Validation("Behavior response is not an object".to_string())
                })?;

                let target_achieved = obj
                    .get("target_achieved")
                    .or_else(|| obj.get("achieved"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                let behavior = match obj.get("behavior") {
                    Some(Value::Null) | None => None,
                    Some(raw) => Some(decode_unit(raw.clone(), kind, 0)?),
                };

                if behavior.is_none() && !target_achieved {
                    return Err(Error::Validation(
                        "Behavior response has neither a behavior nor a target verdict"
                            .to_string(),
                    ));
                }

                Ok(PlanFragment::Behavior {
                    behavior,
                    target_achieved,
                    notes,
                })
            }
        }
    }

    /// Merge a decoded fragment into the tracker.
    ///
    /// `honor_achieved` decides whether a "target achieved" verdict ends the
    /// step; when false the fragment must carry a behavior.
    pub fn merge(
        &self,
        fragment: PlanFragment,
        tracker: &mut ProgressTracker,
        honor_achieved: bool,
    ) -> Result<Applied> {
        match fragment {
            PlanFragment::Stages { stages, notes } => {
                let count = stages.len();
                tracker.stages.extend(stages)?;
                tracker.stages.set_notes(notes);
                Ok(Applied::Planned {
                    kind: PlanKind::Stages,
                    count,
                })
            }
            PlanFragment::Steps { steps, notes } => {
                let count = steps.len();
                tracker.steps.extend(steps)?;
                tracker.steps.set_notes(notes);
                Ok(Applied::Planned {
                    kind: PlanKind::Steps,
                    count,
                })
            }
            PlanFragment::Behavior {
                behavior,
                target_achieved,
                notes,
            } => {
                if target_achieved && honor_achieved {
                    tracker.behaviors.set_notes(notes);
                    return Ok(Applied::TargetAchieved);
                }
                let behavior = behavior.ok_or_else(|| {
                    Error::Validation(
                        "Target verdict not applicable here and no behavior given".to_string(),
                    )
                })?;
                let id = behavior.id.clone();
                tracker.behaviors.replace_current(behavior)?;
                tracker.behaviors.set_notes(notes);
                Ok(Applied::Behavior { id })
            }
        }
    }

    /// Decode and merge in one go
    pub fn apply(
        &self,
        response: &Value,
        kind: PlanKind,
        tracker: &mut ProgressTracker,
        honor_achieved: bool,
    ) -> Result<Applied> {
        let fragment = self.parse(response, kind)?;
        let applied = self.merge(fragment, tracker, honor_achieved)?;
        debug!("Merged {} fragment: {:?}", kind, applied);
        Ok(applied)
    }
}

fn decode_unit(item: Value, kind: PlanKind, index: usize) -> Result<PlanUnit> {
    let raw: RawUnit = serde_json::from_value(item)
        .map_err(|e| Error::Validation(format!("{} entry {}: {}", kind, index, e)))?;
    raw.validate(kind, index)
}

/// Accept JSON values, JSON text, and JSON inside a Markdown fence
fn normalize(response: &Value) -> Result<Value> {
    match response {
        Value::String(text) => {
            let body = fence_regex()
                .captures(text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str())
                .unwrap_or(text.as_str());
            serde_json::from_str(body.trim())
                .map_err(|e| Error::Validation(format!("Planner response is not JSON: {}", e)))
        }
        other => Ok(other.clone()),
    }
}

fn extract_notes(response: &Value) -> TierNotes {
    let text = |key: &str| {
        response.get(key).and_then(|v| match v {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
    };
    TierNotes {
        focus: text("focus"),
        goals: text("goals"),
    }
}
