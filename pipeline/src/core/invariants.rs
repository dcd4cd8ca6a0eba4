//! Semantic invariants not expressible via JSON Schema.

use crate::core::ids::{check_id, check_sibling_widths};
use crate::state::{IterationState, PipelineState, SpecStatus, TaskStatus};

/// Check semantic invariants of a loaded state document:
/// - ids are path-safe and siblings share numeric widths
/// - `current*` pointers name an existing child
/// - a `completed` parent has only completed children
/// - children only move past `pending` once their parent is in progress
/// - `iterationsUsed <= totalAttemptsEver`
pub fn validate_invariants(state: &PipelineState) -> Vec<String> {
    let mut errors = Vec::new();

    check_ids(
        state.milestones.keys().map(String::as_str),
        "milestones",
        &mut errors,
    );
    if let Some(current) = &state.current_milestone_id
        && !state.milestones.contains_key(current)
    {
        errors.push(format!("currentMilestone '{current}' does not exist"));
    }

    for (mid, milestone) in &state.milestones {
        let path = mid.as_str();
        check_iteration(path, "planning", &milestone.planning, &mut errors);
        check_ids(
            milestone.phases.keys().map(String::as_str),
            path,
            &mut errors,
        );
        if let Some(current) = &milestone.current_phase_id
            && !milestone.phases.contains_key(current)
        {
            errors.push(format!("{path}: currentPhase '{current}' does not exist"));
        }
        if milestone.status == SpecStatus::Completed && !milestone.all_phases_completed() {
            errors.push(format!(
                "{path}: milestone is completed but has unfinished phases"
            ));
        }

        for (pid, phase) in &milestone.phases {
            let path = format!("{mid}/{pid}");
            check_iteration(&path, "planning", &phase.planning, &mut errors);
            if phase.status != SpecStatus::Pending && !parent_started(milestone.status) {
                errors.push(format!(
                    "{path}: phase is {} but milestone is {}",
                    phase.status.as_str(),
                    milestone.status.as_str()
                ));
            }
            check_ids(phase.tasks.keys().map(String::as_str), &path, &mut errors);
            if let Some(current) = &phase.current_task_id
                && !phase.tasks.contains_key(current)
            {
                errors.push(format!("{path}: currentTask '{current}' does not exist"));
            }
            if phase.status == SpecStatus::Completed && !phase.all_tasks_completed() {
                errors.push(format!("{path}: phase is completed but has unfinished tasks"));
            }

            for (tid, task) in &phase.tasks {
                let path = format!("{mid}/{pid}/{tid}");
                check_iteration(&path, "planning", &task.planning, &mut errors);
                check_iteration(&path, "implementation", &task.implementation, &mut errors);
                if task.status != TaskStatus::Pending && !parent_started(phase.status) {
                    errors.push(format!(
                        "{path}: task is {} but phase is {}",
                        task.status.as_str(),
                        phase.status.as_str()
                    ));
                }
            }
        }
    }

    errors
}

fn parent_started(status: SpecStatus) -> bool {
    matches!(status, SpecStatus::InProgress | SpecStatus::Completed)
}

fn check_ids<'a>(ids: impl Iterator<Item = &'a str> + Clone, path: &str, errors: &mut Vec<String>) {
    for id in ids.clone() {
        if let Some(err) = check_id(id) {
            errors.push(format!("{path}: {err}"));
        }
    }
    for err in check_sibling_widths(ids) {
        errors.push(format!("{path}: {err}"));
    }
}

fn check_iteration(path: &str, stage: &str, it: &IterationState, errors: &mut Vec<String>) {
    if it.iterations_used > it.total_attempts_ever {
        errors.push(format!(
            "{path}: {stage} iterationsUsed {} exceeds totalAttemptsEver {}",
            it.iterations_used, it.total_attempts_ever
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{phase_with_tasks, state_with_milestone, task};

    #[test]
    fn consistent_state_has_no_errors() {
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
        assert_eq!(validate_invariants(&state), Vec::<String>::new());
    }

    #[test]
    fn reports_dangling_pointers_and_early_children() {
        let mut state = state_with_milestone(
            "m01",
            SpecStatus::SpecLocked,
            vec![(
                "p01",
                phase_with_tasks(SpecStatus::Planning, vec![("t01", task(TaskStatus::Pending))]),
            )],
        );
        state.current_milestone_id = Some("m02".to_string());
        let milestone = state.milestones.get_mut("m01").expect("m01");
        milestone.current_phase_id = Some("p09".to_string());

        let errors = validate_invariants(&state);
        assert!(errors.iter().any(|e| e.contains("currentMilestone 'm02'")));
        assert!(errors.iter().any(|e| e.contains("currentPhase 'p09'")));
        assert!(
            errors
                .iter()
                .any(|e| e == "m01/p01: phase is planning but milestone is spec_locked")
        );
    }

    #[test]
    fn reports_completed_parent_with_open_child_and_bad_counters() {
        let mut state = state_with_milestone(
            "m01",
            SpecStatus::InProgress,
            vec![(
                "p01",
                phase_with_tasks(
                    SpecStatus::Completed,
                    vec![("t01", task(TaskStatus::Implementing))],
                ),
            )],
        );
        let t01 = state
            .milestones
            .get_mut("m01")
            .and_then(|m| m.phases.get_mut("p01"))
            .and_then(|p| p.tasks.get_mut("t01"))
            .expect("t01");
        t01.implementation.iterations_used = 2;

        let errors = validate_invariants(&state);
        assert!(errors.iter().any(|e| e.contains("phase is completed but has unfinished tasks")));
        assert!(errors.iter().any(|e| e.contains("implementation iterationsUsed 2")));
    }

    #[test]
    fn reports_mixed_width_ids() {
        let state = PipelineState::new("demo", ["m1", "m10"]);
        let errors = validate_invariants(&state);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("milestones: ids 'm1' and 'm10'"));
    }
}
