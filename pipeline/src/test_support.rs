//! Test-only helpers: state builders and scripted collaborators.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::io::agent::{AgentInvoker, AgentResponse, CallOptions, Role, decode_decision};
use crate::io::config::PipelineConfig;
use crate::io::git::GitOps;
use crate::io::init::{InitOptions, ProjectPaths, init_project};
use crate::state::{MilestoneState, PhaseState, PipelineState, SpecStatus, TaskState, TaskStatus};

/// A task with the given status and zeroed counters.
pub fn task(status: TaskStatus) -> TaskState {
    TaskState {
        status,
        ..TaskState::default()
    }
}

/// A phase with the given status and tasks.
pub fn phase_with_tasks(status: SpecStatus, tasks: Vec<(&str, TaskState)>) -> PhaseState {
    PhaseState {
        status,
        tasks: tasks
            .into_iter()
            .map(|(id, task)| (id.to_string(), task))
            .collect(),
        ..PhaseState::default()
    }
}

/// A single-milestone state named `demo`.
pub fn state_with_milestone(
    id: &str,
    status: SpecStatus,
    phases: Vec<(&str, PhaseState)>,
) -> PipelineState {
    let mut state = PipelineState::new("demo", [id]);
    state.milestones.insert(
        id.to_string(),
        MilestoneState {
            status,
            phases: phases
                .into_iter()
                .map(|(id, phase)| (id.to_string(), phase))
                .collect(),
            ..MilestoneState::default()
        },
    );
    state
}

/// A role bound to a fake agent name, with default options.
pub fn test_role(name: &str) -> Role {
    Role {
        name: name.to_string(),
        agent: "scripted".to_string(),
        options: CallOptions::default(),
    }
}

/// One call observed by [`ScriptedInvoker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub role: String,
    pub prompt: String,
    pub expect_decision: bool,
}

/// Agent invoker that replays canned responses in order and records every call.
///
/// Running out of responses is an error, which makes unexpected agent calls
/// fail the test loudly.
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    responses: RefCell<VecDeque<String>>,
    calls: RefCell<Vec<RecordedCall>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain text response.
    pub fn text(self, raw: &str) -> Self {
        self.responses.borrow_mut().push_back(raw.to_string());
        self
    }

    /// Queue an approving verdict.
    pub fn approve(self, feedback: &str) -> Self {
        self.text(&verdict_text("approved", feedback))
    }

    /// Queue a rejecting verdict.
    pub fn reject(self, feedback: &str) -> Self {
        self.text(&verdict_text("rejected", feedback))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    /// Role names of every call so far, in order.
    pub fn roles(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.role.clone()).collect()
    }

    pub fn remaining(&self) -> usize {
        self.responses.borrow().len()
    }
}

fn verdict_text(verdict: &str, feedback: &str) -> String {
    format!(
        "Review notes.\n\n```json\n{}\n```\n",
        serde_json::json!({ "verdict": verdict, "feedback": feedback })
    )
}

impl AgentInvoker for ScriptedInvoker {
    fn call(&self, role: &Role, prompt: &str, options: &CallOptions) -> Result<AgentResponse> {
        self.calls.borrow_mut().push(RecordedCall {
            role: role.name.clone(),
            prompt: prompt.to_string(),
            expect_decision: options.expect_decision,
        });
        let raw_text = self
            .responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("unexpected agent call for role {}", role.name))?;
        let decision = if options.expect_decision {
            Some(decode_decision(role, &raw_text)?)
        } else {
            None
        };
        Ok(AgentResponse { raw_text, decision })
    }
}

/// Git operations recorded as strings such as `branch m01/p01`.
#[derive(Debug, Default)]
pub struct RecordingGit {
    ops: RefCell<Vec<String>>,
    fail: bool,
}

impl RecordingGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorder whose every operation fails after being recorded.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.borrow().clone()
    }

    fn record(&self, op: String) -> Result<()> {
        self.ops.borrow_mut().push(op);
        if self.fail {
            return Err(anyhow!("git unavailable"));
        }
        Ok(())
    }
}

impl GitOps for RecordingGit {
    fn create_phase_branch(&self, milestone_id: &str, phase_id: &str) -> Result<()> {
        self.record(format!("branch {milestone_id}/{phase_id}"))
    }

    fn commit_task_completion(
        &self,
        milestone_id: &str,
        phase_id: &str,
        task_id: &str,
    ) -> Result<()> {
        self.record(format!("commit {milestone_id}/{phase_id}/{task_id}"))
    }

    fn create_phase_pr(&self, milestone_id: &str, phase_id: &str) -> Result<()> {
        self.record(format!("pr {milestone_id}/{phase_id}"))
    }

    fn return_to_main(&self) -> Result<()> {
        self.record("main".to_string())
    }
}

/// An initialized project in a temp directory.
pub struct TestProject {
    temp: TempDir,
    paths: ProjectPaths,
}

impl TestProject {
    pub fn new(milestones: &[&str]) -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let paths = init_project(
            temp.path(),
            &InitOptions {
                project: "demo".to_string(),
                milestones: milestones.iter().map(|m| m.to_string()).collect(),
                force: false,
            },
        )?;
        Ok(Self { temp, paths })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn config(&self) -> PipelineConfig {
        PipelineConfig::default()
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        Ok(fs::read_to_string(self.root().join(rel))?)
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.root().join(rel).exists()
    }
}
