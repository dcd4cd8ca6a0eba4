//! Per-kind status tables and the single transition guard.
//!
//! Every status change in the walker goes through [`transition`]. The tables
//! are linear chains: each status may only move to the next one.

use std::fmt;

use thiserror::Error;

use crate::state::{MilestoneState, PhaseState, SpecStatus, TaskState, TaskStatus};

/// A status enum with a static table of legal successors.
pub trait Lifecycle: Copy + Eq + fmt::Debug + 'static {
    fn allowed_next(self) -> &'static [Self];
    fn label(self) -> &'static str;
}

impl Lifecycle for SpecStatus {
    fn allowed_next(self) -> &'static [Self] {
        match self {
            SpecStatus::Pending => &[SpecStatus::Planning],
            SpecStatus::Planning => &[SpecStatus::SpecLocked],
            SpecStatus::SpecLocked => &[SpecStatus::InProgress],
            SpecStatus::InProgress => &[SpecStatus::Completed],
            SpecStatus::Completed => &[],
        }
    }

    fn label(self) -> &'static str {
        self.as_str()
    }
}

impl Lifecycle for TaskStatus {
    fn allowed_next(self) -> &'static [Self] {
        match self {
            TaskStatus::Pending => &[TaskStatus::Planning],
            TaskStatus::Planning => &[TaskStatus::PlanLocked],
            TaskStatus::PlanLocked => &[TaskStatus::Implementing],
            TaskStatus::Implementing => &[TaskStatus::Completed],
            TaskStatus::Completed => &[],
        }
    }

    fn label(self) -> &'static str {
        self.as_str()
    }
}

/// An entity whose status is guarded by a [`Lifecycle`] table.
pub trait Staged {
    type Status: Lifecycle;
    const KIND: &'static str;

    fn status(&self) -> Self::Status;
    fn set_status(&mut self, status: Self::Status);
}

impl Staged for MilestoneState {
    type Status = SpecStatus;
    const KIND: &'static str = "milestone";

    fn status(&self) -> SpecStatus {
        self.status
    }

    fn set_status(&mut self, status: SpecStatus) {
        self.status = status;
    }
}

impl Staged for PhaseState {
    type Status = SpecStatus;
    const KIND: &'static str = "phase";

    fn status(&self) -> SpecStatus {
        self.status
    }

    fn set_status(&mut self, status: SpecStatus) {
        self.status = status;
    }
}

impl Staged for TaskState {
    type Status = TaskStatus;
    const KIND: &'static str = "task";

    fn status(&self) -> TaskStatus {
        self.status
    }

    fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }
}

/// Attempted status change outside the entity's table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal {kind} transition {from} -> {to} (allowed: {})", format_allowed(.allowed))]
pub struct IllegalTransition {
    pub kind: &'static str,
    pub from: &'static str,
    pub to: &'static str,
    pub allowed: Vec<&'static str>,
}

fn format_allowed(allowed: &[&'static str]) -> String {
    if allowed.is_empty() {
        return "none".to_string();
    }
    allowed.join(", ")
}

/// Move `entity` to `next` if the table allows it; otherwise leave it untouched.
pub fn transition<E: Staged>(entity: &mut E, next: E::Status) -> Result<(), IllegalTransition> {
    let current = entity.status();
    let allowed = current.allowed_next();
    if !allowed.contains(&next) {
        return Err(IllegalTransition {
            kind: E::KIND,
            from: current.label(),
            to: next.label(),
            allowed: allowed.iter().map(|s| s.label()).collect(),
        });
    }
    entity.set_status(next);
    Ok(())
}
