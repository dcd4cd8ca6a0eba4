//! Deterministic resume-point selection.
//!
//! The walker performs the same traversal as it executes; this finder answers
//! "where would the next run start?" without side effects.

use std::collections::BTreeMap;
use std::fmt;

use crate::state::{PipelineState, SpecStatus, TaskStatus};

/// Next unit of work. `None` fields mean the enclosing level itself is the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    pub milestone_id: String,
    pub phase_id: Option<String>,
    pub task_id: Option<String>,
}

impl fmt::Display for ResumePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.milestone_id)?;
        if let Some(phase_id) = &self.phase_id {
            write!(f, "/{phase_id}")?;
        }
        if let Some(task_id) = &self.task_id {
            write!(f, "/{task_id}")?;
        }
        Ok(())
    }
}

/// Find the next unit of work, or `None` when every milestone is completed.
pub fn find_resume_point(state: &PipelineState) -> Option<ResumePoint> {
    let milestone_id = pick(
        &state.milestones,
        state.current_milestone_id.as_deref(),
        |m| m.status == SpecStatus::Completed,
    )?;
    let milestone = &state.milestones[milestone_id];
    let at_milestone = || ResumePoint {
        milestone_id: milestone_id.to_string(),
        phase_id: None,
        task_id: None,
    };

    if needs_own_step(milestone.status) {
        return Some(at_milestone());
    }

    let Some(phase_id) = pick(
        &milestone.phases,
        milestone.current_phase_id.as_deref(),
        |p| p.status == SpecStatus::Completed,
    ) else {
        return Some(at_milestone());
    };
    let phase = &milestone.phases[phase_id];
    let at_phase = || ResumePoint {
        phase_id: Some(phase_id.to_string()),
        ..at_milestone()
    };

    if needs_own_step(phase.status) {
        return Some(at_phase());
    }

    let Some(task_id) = pick(&phase.tasks, phase.current_task_id.as_deref(), |t| {
        t.status == TaskStatus::Completed
    }) else {
        return Some(at_phase());
    };

    Some(ResumePoint {
        task_id: Some(task_id.to_string()),
        ..at_phase()
    })
}

/// A milestone/phase that still has to plan or scaffold is itself the resume point.
fn needs_own_step(status: SpecStatus) -> bool {
    matches!(
        status,
        SpecStatus::Pending | SpecStatus::Planning | SpecStatus::SpecLocked
    )
}

/// Prefer the cached pointer when it names an open child, else the first open child
/// in lexical order.
fn pick<'a, T>(
    children: &'a BTreeMap<String, T>,
    pointer: Option<&str>,
    is_completed: impl Fn(&T) -> bool,
) -> Option<&'a str> {
    if let Some(id) = pointer
        && let Some((key, child)) = children.get_key_value(id)
        && !is_completed(child)
    {
        return Some(key.as_str());
    }
    children
        .iter()
        .find(|(_, child)| !is_completed(child))
        .map(|(key, _)| key.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{phase_with_tasks, state_with_milestone, task};

    fn point(m: &str, p: Option<&str>, t: Option<&str>) -> ResumePoint {
        ResumePoint {
            milestone_id: m.to_string(),
            phase_id: p.map(str::to_string),
            task_id: t.map(str::to_string),
        }
    }

    #[test]
    fn picks_first_open_task_in_open_phase() {
        let state = state_with_milestone(
            "m01",
            SpecStatus::InProgress,
            vec![(
                "p01",
                phase_with_tasks(
                    SpecStatus::InProgress,
                    vec![("t01", task(TaskStatus::Completed)), ("t02", task(TaskStatus::Pending))],
                ),
            )],
        );
        assert_eq!(
            find_resume_point(&state),
            Some(point("m01", Some("p01"), Some("t02")))
        );
    }

    #[test]
    fn complete_state_has_no_resume_point() {
        let mut state = PipelineState::new("demo", ["m01", "m02"]);
        for m in state.milestones.values_mut() {
            m.status = SpecStatus::Completed;
        }
        assert_eq!(find_resume_point(&state), None);
    }

    #[test]
    fn skips_completed_milestones_lexically() {
        let mut state = PipelineState::new("demo", ["m02", "m01", "m03"]);
        state.milestones.get_mut("m01").expect("m01").status = SpecStatus::Completed;
        assert_eq!(find_resume_point(&state), Some(point("m02", None, None)));
    }

    #[test]
    fn current_pointer_wins_when_open() {
        let mut state = PipelineState::new("demo", ["m01", "m02"]);
        state.current_milestone_id = Some("m02".to_string());
        assert_eq!(find_resume_point(&state), Some(point("m02", None, None)));
    }

    #[test]
    fn stale_pointer_to_completed_child_falls_back_to_scan() {
        let mut state = state_with_milestone(
            "m01",
            SpecStatus::InProgress,
            vec![
                ("p01", phase_with_tasks(SpecStatus::Completed, vec![])),
                ("p02", phase_with_tasks(SpecStatus::Pending, vec![])),
            ],
        );
        state.milestones.get_mut("m01").expect("m01").current_phase_id = Some("p01".to_string());
        assert_eq!(find_resume_point(&state), Some(point("m01", Some("p02"), None)));
    }

    #[test]
    fn planning_levels_are_their_own_resume_point() {
        let state = state_with_milestone(
            "m01",
            SpecStatus::InProgress,
            vec![(
                "p01",
                phase_with_tasks(SpecStatus::Planning, vec![("t01", task(TaskStatus::Pending))]),
            )],
        );
        assert_eq!(find_resume_point(&state), Some(point("m01", Some("p01"), None)));
    }

    #[test]
    fn level_with_all_children_done_awaits_its_own_completion() {
        let state = state_with_milestone(
            "m01",
            SpecStatus::InProgress,
            vec![(
                "p01",
                phase_with_tasks(
                    SpecStatus::InProgress,
                    vec![("t01", task(TaskStatus::Completed))],
                ),
            )],
        );
        assert_eq!(find_resume_point(&state), Some(point("m01", Some("p01"), None)));

        let state = state_with_milestone(
            "m01",
            SpecStatus::InProgress,
            vec![("p01", phase_with_tasks(SpecStatus::Completed, vec![]))],
        );
        assert_eq!(find_resume_point(&state), Some(point("m01", None, None)));
    }

    #[test]
    fn display_joins_ids_with_slashes() {
        assert_eq!(point("m01", Some("p02"), Some("t03")).to_string(), "m01/p02/t03");
        assert_eq!(point("m01", None, None).to_string(), "m01");
    }
}
