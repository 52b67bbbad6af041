//! Three-tier progress tracking (stages → steps → behaviors)
//!
//! Each tier keeps an append-only `completed` list, at most one `current`
//! entry, and an ordered `remaining` list. An id lives in exactly one of the
//! three places. Steps are scoped to the current stage and behaviors to the
//! current step: ids must be unique among siblings only, and entries
//! completed under an earlier parent stay in `completed`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{Error, Result};

/// Anything tracked by a tier must expose a stable id
pub trait Identified {
    fn id(&self) -> &str;
}

/// A planned unit of work: a stage, a step, or a behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanUnit {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub goal: String,
    /// Named references into the context
    #[serde(default)]
    pub required_inputs: Vec<String>,
    /// Named outputs this unit produces
    #[serde(default)]
    pub produced_artifacts: Vec<String>,
    /// Evaluated by the planner, never locally
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Planner-specific extras (e.g. PCS considerations), kept verbatim
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PlanUnit {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            goal: String::new(),
            required_inputs: Vec::new(),
            produced_artifacts: Vec::new(),
            acceptance_criteria: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Identified for PlanUnit {
    fn id(&self) -> &str {
        &self.id
    }
}

pub type Stage = PlanUnit;
pub type Step = PlanUnit;
pub type Behavior = PlanUnit;

/// Advisory side-channel text attached to a tier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierNotes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goals: Option<String>,
}

impl TierNotes {
    /// Overwrite only the fields that are present in `other`
    pub fn update(&mut self, other: TierNotes) {
        if other.focus.is_some() {
            self.focus = other.focus;
        }
        if other.goals.is_some() {
            self.goals = other.goals;
        }
    }
}

/// completed / current / remaining for one granularity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressTier<T> {
    completed: Vec<T>,
    current: Option<T>,
    remaining: Vec<T>,
    #[serde(default)]
    notes: TierNotes,
    /// Index into `completed` where the current parent's entries start
    #[serde(skip)]
    scope_start: usize,
}

impl<T> Default for ProgressTier<T> {
    fn default() -> Self {
        Self {
            completed: Vec::new(),
            current: None,
            remaining: Vec::new(),
            notes: TierNotes::default(),
            scope_start: 0,
        }
    }
}

impl<T: Identified + Clone> ProgressTier<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> &[T] {
        &self.completed
    }

    /// Entries completed under the current parent
    pub fn completed_in_scope(&self) -> &[T] {
        &self.completed[self.scope_start..]
    }

    pub fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    pub fn remaining(&self) -> &[T] {
        &self.remaining
    }

    pub fn notes(&self) -> &TierNotes {
        &self.notes
    }

    pub fn set_notes(&mut self, notes: TierNotes) {
        self.notes.update(notes);
    }

    /// Whether `id` is tracked under the current parent
    pub fn contains(&self, id: &str) -> bool {
        self.current.as_ref().map(|c| c.id() == id).unwrap_or(false)
            || self.completed_in_scope().iter().any(|c| c.id() == id)
            || self.remaining.iter().any(|r| r.id() == id)
    }

    /// Reject any id already tracked in scope, or repeated within `items`
    fn check_new<'a>(&self, items: impl IntoIterator<Item = &'a T>) -> Result<()>
    where
        T: 'a,
    {
        let mut seen = HashSet::new();
        for item in items {
            if !seen.insert(item.id()) {
                return Err(Error::Validation(format!(
                    "Duplicate id in fragment: {}",
                    item.id()
                )));
            }
            if self.contains(item.id()) {
                return Err(Error::Validation(format!(
                    "Id already tracked: {}",
                    item.id()
                )));
            }
        }
        Ok(())
    }

    /// Append planned entries in order. When nothing is current the first
    /// new entry is promoted. Either all entries are merged or none.
    pub fn extend(&mut self, items: Vec<T>) -> Result<()> {
        self.check_new(&items)?;
        self.remaining.extend(items);
        if self.current.is_none() {
            self.promote_next();
        }
        Ok(())
    }

    /// Make `item` the current entry, completing the previous one.
    pub fn replace_current(&mut self, item: T) -> Result<()> {
        self.check_new(std::iter::once(&item))?;
        self.complete_current();
        self.current = Some(item);
        Ok(())
    }

    /// Move the current entry to `completed`
    pub fn complete_current(&mut self) -> Option<&T> {
        let done = self.current.take()?;
        self.completed.push(done);
        self.completed.last()
    }

    /// Pull the next remaining entry into `current`.
    /// Returns false when something is already current or nothing remains.
    pub fn promote_next(&mut self) -> bool {
        if self.current.is_some() || self.remaining.is_empty() {
            return false;
        }
        self.current = Some(self.remaining.remove(0));
        true
    }

    pub fn is_exhausted(&self) -> bool {
        self.current.is_none() && self.remaining.is_empty()
    }

    /// Start entries for a new parent. A still-current entry is completed,
    /// unstarted ones are dropped, and everything completed so far is kept.
    pub fn begin_scope(&mut self) {
        self.complete_current();
        self.remaining.clear();
        self.scope_start = self.completed.len();
    }
}

/// Stage, step, and behavior tiers of one session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressTracker {
    pub stages: ProgressTier<Stage>,
    pub steps: ProgressTier<Step>,
    pub behaviors: ProgressTier<Behavior>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope the step and behavior tiers to a newly current stage
    pub fn enter_stage(&mut self) {
        self.steps.begin_scope();
        self.behaviors.begin_scope();
    }

    /// Scope the behavior tier to a newly current step
    pub fn enter_step(&mut self) {
        self.behaviors.begin_scope();
    }

    pub fn current_stage_id(&self) -> Option<&str> {
        self.stages.current().map(|s| s.id.as_str())
    }

    pub fn current_step_id(&self) -> Option<&str> {
        self.steps.current().map(|s| s.id.as_str())
    }

    pub fn current_behavior_id(&self) -> Option<&str> {
        self.behaviors.current().map(|b| b.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(ids: &[&str]) -> Vec<PlanUnit> {
        ids.iter().map(|id| PlanUnit::new(*id, *id)).collect()
    }

    fn assert_disjoint(tier: &ProgressTier<PlanUnit>) {
        let completed: HashSet<_> = tier.completed().iter().map(|u| u.id.clone()).collect();
        let remaining: HashSet<_> = tier.remaining().iter().map(|u| u.id.clone()).collect();
        assert!(completed.is_disjoint(&remaining));
        if let Some(cur) = tier.current() {
            assert!(!completed.contains(&cur.id));
            assert!(!remaining.contains(&cur.id));
        }
    }

    #[test]
    fn test_extend_promotes_first_when_empty() {
        let mut tier = ProgressTier::new();
        tier.extend(units(&["s1", "s2", "s3"])).unwrap();

        assert_eq!(tier.current().unwrap().id, "s1");
        assert_eq!(tier.remaining().len(), 2);
        assert_disjoint(&tier);
    }

    #[test]
    fn test_extend_keeps_current() {
        let mut tier = ProgressTier::new();
        tier.extend(units(&["s1"])).unwrap();
        tier.extend(units(&["s2"])).unwrap();

        assert_eq!(tier.current().unwrap().id, "s1");
        assert_eq!(tier.remaining()[0].id, "s2");
    }

    #[test]
    fn test_collision_rejected_without_partial_merge() {
        let mut tier = ProgressTier::new();
        tier.extend(units(&["s1", "s2"])).unwrap();
        tier.complete_current();
        tier.promote_next();

        let err = tier.extend(units(&["s3", "s1"])).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(tier.remaining().len(), 0);
        assert_eq!(tier.current().unwrap().id, "s2");

        assert!(tier.extend(units(&["s4", "s4"])).is_err());
        assert!(!tier.contains("s4"));
    }

    #[test]
    fn test_completed_only_grows() {
        let mut tier = ProgressTier::new();
        tier.extend(units(&["a", "b", "c"])).unwrap();

        let mut last_len = 0;
        while tier.current().is_some() {
            tier.complete_current();
            assert!(tier.completed().len() > last_len);
            last_len = tier.completed().len();
            tier.promote_next();
            assert_disjoint(&tier);
        }
        assert!(tier.is_exhausted());
        let ids: Vec<_> = tier.completed().iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn test_replace_current_completes_previous() {
        let mut tier = ProgressTier::new();
        tier.replace_current(PlanUnit::new("b1", "explore")).unwrap();
        tier.replace_current(PlanUnit::new("b2", "model")).unwrap();

        assert_eq!(tier.current().unwrap().id, "b2");
        assert_eq!(tier.completed()[0].id, "b1");
        assert!(tier.replace_current(PlanUnit::new("b1", "again")).is_err());
        assert_eq!(tier.current().unwrap().id, "b2");
    }

    #[test]
    fn test_tracker_scoping() {
        let mut tracker = ProgressTracker::new();
        tracker.stages.extend(units(&["stage-1", "stage-2"])).unwrap();
        tracker.steps.extend(units(&["step-1"])).unwrap();
        tracker.behaviors.replace_current(PlanUnit::new("b1", "x")).unwrap();

        tracker.enter_step();
        assert!(tracker.behaviors.current().is_none());
        assert_eq!(tracker.behaviors.completed()[0].id, "b1");
        assert!(tracker.behaviors.completed_in_scope().is_empty());
        assert_eq!(tracker.current_step_id(), Some("step-1"));

        tracker.steps.complete_current();
        tracker.stages.complete_current();
        tracker.stages.promote_next();
        tracker.enter_stage();
        assert!(tracker.steps.is_exhausted());
        assert_eq!(tracker.steps.completed().len(), 1);
        assert!(tracker.steps.completed_in_scope().is_empty());
        assert_eq!(tracker.current_stage_id(), Some("stage-2"));
    }

    #[test]
    fn test_ids_unique_among_siblings_only() {
        let mut tier = ProgressTier::new();
        tier.extend(units(&["step-1", "step-2"])).unwrap();
        tier.complete_current();
        tier.promote_next();
        tier.complete_current();

        tier.begin_scope();
        tier.extend(units(&["step-1"])).unwrap();
        assert_eq!(tier.current().unwrap().id, "step-1");
        assert!(tier.extend(units(&["step-1"])).is_err());

        tier.complete_current();
        let ids: Vec<_> = tier.completed().iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, ["step-1", "step-2", "step-1"]);
        assert_eq!(tier.completed_in_scope().len(), 1);
    }

    #[test]
    fn test_begin_scope_drops_unstarted() {
        let mut tier = ProgressTier::new();
        tier.extend(units(&["a", "b"])).unwrap();
        tier.begin_scope();

        assert!(tier.is_exhausted());
        assert_eq!(tier.completed()[0].id, "a");
        assert!(!tier.contains("a"));
        assert!(!tier.contains("b"));
    }

    #[test]
    fn test_notes_update_partial() {
        let mut tier: ProgressTier<PlanUnit> = ProgressTier::new();
        tier.set_notes(TierNotes {
            focus: Some("clean data".into()),
            goals: Some("tidy frame".into()),
        });
        tier.set_notes(TierNotes {
            focus: Some("plot".into()),
            goals: None,
        });
        assert_eq!(tier.notes().focus.as_deref(), Some("plot"));
        assert_eq!(tier.notes().goals.as_deref(), Some("tidy frame"));
    }
}
