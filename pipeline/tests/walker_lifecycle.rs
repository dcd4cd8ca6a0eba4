//! Multi-run lifecycle tests: review gates, crash recovery and resume.
//!
//! Each test drives the walker through `run_pipeline` with scripted agents,
//! reloading the state from disk between runs the way separate process
//! invocations would.

use pipeline::core::resume::find_resume_point;
use pipeline::io::config::PipelineConfig;
use pipeline::io::scaffold::HeadingScaffolder;
use pipeline::io::state_store::load_state;
use pipeline::io::templates::PromptTemplates;
use pipeline::state::{SpecStatus, TaskStatus};
use pipeline::test_support::{RecordingGit, ScriptedInvoker, TestProject};
use pipeline::walker::{Collaborators, WalkOutcome, run_pipeline};

fn run(
    project: &TestProject,
    config: &PipelineConfig,
    agent: &ScriptedInvoker,
    git: &RecordingGit,
) -> anyhow::Result<WalkOutcome> {
    let templates = PromptTemplates::new(None);
    run_pipeline(
        project.paths(),
        config,
        Collaborators {
            agent,
            templates: &templates,
            scaffolder: &HeadingScaffolder,
            git,
        },
    )
}

#[test]
fn each_run_completes_one_phase_then_the_milestone() {
    let project = TestProject::new(&["m01"]).expect("project");
    let mut config = project.config();
    config.git.enabled = true;
    let git = RecordingGit::new();

    let first = ScriptedInvoker::new()
        .text("# m01\n\n## Phase p01: Store\n\n## Phase p02: Api\n")
        .approve("ok")
        .text("## Task t01: Write\n")
        .approve("ok")
        .text("plan p01/t01")
        .approve("ok")
        .text("notes p01/t01")
        .approve("ok");
    let outcome = run(&project, &config, &first, &git).expect("first run");
    assert_eq!(
        outcome,
        WalkOutcome::Halted {
            milestone_id: "m01".to_string(),
            phase_id: "p01".to_string(),
        }
    );
    assert_eq!(first.remaining(), 0);

    let state = load_state(&project.paths().state_path).expect("load");
    assert_eq!(state.milestones["m01"].phases["p02"].status, SpecStatus::Pending);
    let next = find_resume_point(&state).expect("resume point");
    assert_eq!(next.to_string(), "m01/p02");

    let second = ScriptedInvoker::new()
        .text("## Task t01: Serve\n## Task t02: Document\n")
        .approve("ok")
        .text("plan t01")
        .approve("ok")
        .text("notes t01")
        .approve("ok")
        .text("plan t02")
        .approve("ok")
        .text("notes t02")
        .approve("ok");
    let outcome = run(&project, &config, &second, &git).expect("second run");
    assert_eq!(
        outcome,
        WalkOutcome::Halted {
            milestone_id: "m01".to_string(),
            phase_id: "p02".to_string(),
        }
    );
    // The milestone spec was never re-planned.
    assert!(!second.roles().is_empty());
    assert!(second.calls().iter().all(|c| !c.prompt.contains("`m01` of")));

    // Third run only marks the milestone completed and finishes.
    let third = ScriptedInvoker::new();
    let outcome = run(&project, &config, &third, &git).expect("third run");
    assert_eq!(outcome, WalkOutcome::Finished);
    assert!(third.calls().is_empty());

    let state = load_state(&project.paths().state_path).expect("load");
    assert!(state.is_complete());
    assert_eq!(state.current_milestone_id, None);
    assert_eq!(
        git.ops(),
        [
            "branch m01/p01",
            "commit m01/p01/t01",
            "pr m01/p01",
            "main",
            "branch m01/p02",
            "commit m01/p02/t01",
            "commit m01/p02/t02",
            "pr m01/p02",
            "main",
        ]
    );
}

#[test]
fn crash_mid_task_resumes_without_repeating_agent_calls() {
    let project = TestProject::new(&["m01"]).expect("project");
    let config = project.config();
    let git = RecordingGit::new();

    // The implementation reviewer never answers: the run dies after the first
    // implementation draft is on disk.
    let crashing = ScriptedInvoker::new()
        .text("## Phase p01: Core\n")
        .approve("ok")
        .text("## Task t01: Only\n")
        .approve("ok")
        .text("plan")
        .reject("add tests")
        .text("plan with tests")
        .approve("ok")
        .text("notes v1");
    let err = run(&project, &config, &crashing, &git).unwrap_err();
    assert!(err.to_string().contains("unexpected agent call for role reviewer"));

    let state = load_state(&project.paths().state_path).expect("load");
    let t01 = &state.milestones["m01"].phases["p01"].tasks["t01"];
    assert_eq!(t01.status, TaskStatus::Implementing);
    assert_eq!(t01.planning.iterations_used, 2);
    assert!(project.exists("milestones/m01/phases/p01/tasks/t01/impl-notes-v1.md"));
    assert!(!project.exists("milestones/m01/phases/p01/tasks/t01/review-v1.md"));

    // Restart: only the review of the existing draft and onwards is paid for.
    let resumed = ScriptedInvoker::new()
        .reject("missing edge case")
        .text("notes v2")
        .reject("still missing")
        .text("notes v3")
        .approve("good");
    let mut config = config;
    config.limits.task_impl = 3;
    let outcome = run(&project, &config, &resumed, &git).expect("resume");
    assert_eq!(outcome, WalkOutcome::Finished);
    assert_eq!(
        resumed.roles(),
        ["reviewer", "implementer", "reviewer", "implementer", "reviewer"]
    );

    let state = load_state(&project.paths().state_path).expect("load");
    let t01 = &state.milestones["m01"].phases["p01"].tasks["t01"];
    assert_eq!(t01.status, TaskStatus::Completed);
    assert_eq!(t01.implementation.iterations_used, 3);
    assert!(!t01.implementation.tiebreaker_used);
    assert_eq!(
        project
            .read("milestones/m01/phases/p01/tasks/t01/impl-final.md")
            .expect("read"),
        "notes v3"
    );
}

#[test]
fn tiebreaker_settles_a_task_plan() {
    let project = TestProject::new(&["m01"]).expect("project");
    let mut config = project.config();
    config.limits.task_plan = 2;
    let git = RecordingGit::new();

    let agent = ScriptedInvoker::new()
        .text("## Phase p01: Core\n")
        .approve("ok")
        .text("## Task t01: Only\n")
        .approve("ok")
        .text("plan a")
        .reject("no")
        .text("plan b")
        .reject("no")
        .text("binding plan")
        .text("notes")
        .approve("ok");
    let outcome = run(&project, &config, &agent, &git).expect("run");
    assert_eq!(outcome, WalkOutcome::Finished);
    assert_eq!(agent.roles().iter().filter(|r| *r == "tiebreaker").count(), 1);

    let state = load_state(&project.paths().state_path).expect("load");
    let t01 = &state.milestones["m01"].phases["p01"].tasks["t01"];
    assert!(t01.planning.tiebreaker_used);
    assert_eq!(t01.planning.iterations_used, 2);
    assert_eq!(
        project
            .read("milestones/m01/phases/p01/tasks/t01/plan-locked.md")
            .expect("read"),
        "binding plan"
    );
}
