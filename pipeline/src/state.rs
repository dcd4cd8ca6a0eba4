//! Persisted workflow state (`.pipeline/state.json`).
//!
//! Child maps are `BTreeMap`s so that iteration order is the lexical order of
//! ids, which is the canonical processing order at every level.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root document, one per project.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    #[serde(rename = "project")]
    pub project_name: String,
    #[serde(rename = "currentMilestone", default)]
    pub current_milestone_id: Option<String>,
    #[serde(default)]
    pub milestones: BTreeMap<String, MilestoneState>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneState {
    pub status: SpecStatus,
    #[serde(default)]
    pub planning: IterationState,
    #[serde(rename = "currentPhase", default)]
    pub current_phase_id: Option<String>,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseState>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseState {
    pub status: SpecStatus,
    #[serde(default)]
    pub planning: IterationState,
    #[serde(rename = "currentTask", default)]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskState>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub status: TaskStatus,
    #[serde(default)]
    pub planning: IterationState,
    #[serde(default)]
    pub implementation: IterationState,
}

/// Bookkeeping for one approval cycle.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IterationState {
    pub iterations_used: u32,
    /// Cumulative across resets of `iterations_used`.
    pub total_attempts_ever: u32,
    pub tiebreaker_used: bool,
}

impl IterationState {
    /// Record the result of a finished cycle.
    ///
    /// A cycle that short-circuited on an existing locked artifact did no new
    /// work, so the counters from the run that produced it are kept.
    pub fn record(&mut self, iterations_used: u32, tiebreaker_used: bool, already_locked: bool) {
        if already_locked {
            return;
        }
        self.iterations_used = iterations_used;
        self.total_attempts_ever = self.total_attempts_ever.saturating_add(iterations_used);
        self.tiebreaker_used = tiebreaker_used;
    }
}

/// Milestone and phase lifecycle.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpecStatus {
    #[default]
    Pending,
    Planning,
    SpecLocked,
    InProgress,
    Completed,
}

impl SpecStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SpecStatus::Pending => "pending",
            SpecStatus::Planning => "planning",
            SpecStatus::SpecLocked => "spec_locked",
            SpecStatus::InProgress => "in_progress",
            SpecStatus::Completed => "completed",
        }
    }
}

/// Task lifecycle.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Planning,
    PlanLocked,
    Implementing,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::PlanLocked => "plan_locked",
            TaskStatus::Implementing => "implementing",
            TaskStatus::Completed => "completed",
        }
    }
}

impl PipelineState {
    /// New state with the given milestones, all `pending`.
    pub fn new<I, S>(project_name: impl Into<String>, milestone_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            project_name: project_name.into(),
            current_milestone_id: None,
            milestones: milestone_ids
                .into_iter()
                .map(|id| (id.into(), MilestoneState::default()))
                .collect(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.milestones
            .values()
            .all(|m| m.status == SpecStatus::Completed)
    }
}

impl MilestoneState {
    pub fn all_phases_completed(&self) -> bool {
        self.phases
            .values()
            .all(|p| p.status == SpecStatus::Completed)
    }
}

impl PhaseState {
    pub fn all_tasks_completed(&self) -> bool {
        self.tasks
            .values()
            .all(|t| t.status == TaskStatus::Completed)
    }
}
