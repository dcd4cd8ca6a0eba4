//! Hierarchy walker: milestones → phases → tasks.
//!
//! One `run` advances the project as far as the persisted state allows. Every
//! status change goes through [`transition`] and is followed by a checkpoint,
//! so a killed process resumes from the last finished step. Finishing a phase
//! with git integration enabled stops the run for human review; that stop is
//! an outcome, not an error.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::transition::transition;
use crate::cycle::{
    ArtifactNames, CycleContext, CycleOutcome, CycleRoles, StageTemplates, run_cycle,
};
use crate::io::agent::{AgentInvoker, Role};
use crate::io::config::PipelineConfig;
use crate::io::git::GitOps;
use crate::io::init::{LOCKED_SPEC, ProjectPaths, SPEC};
use crate::io::scaffold::Scaffolder;
use crate::io::state_store::{checkpoint, load_state};
use crate::io::templates::{TemplateLoader, TemplateVars};
use crate::state::{
    MilestoneState, PhaseState, PipelineState, SpecStatus, TaskState, TaskStatus,
};

/// How a walker run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkOutcome {
    /// A phase completed and the run stopped at the review gate.
    Halted {
        milestone_id: String,
        phase_id: String,
    },
    /// Every milestone is completed.
    Finished,
}

/// Per-level traversal result.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Flow {
    Continue,
    Halted { phase_id: String },
}

/// External collaborators the walker drives.
pub struct Collaborators<'a, A, T, S, G> {
    pub agent: &'a A,
    pub templates: &'a T,
    pub scaffolder: &'a S,
    pub git: &'a G,
}

/// One unit of work as seen by the cycle engine.
struct UnitRef {
    level: &'static str,
    unit_path: String,
    dir: PathBuf,
    parent_dir: Option<PathBuf>,
}

pub struct Walker<'a, A, T, S, G> {
    paths: &'a ProjectPaths,
    config: &'a PipelineConfig,
    deps: Collaborators<'a, A, T, S, G>,
    state: PipelineState,
}

impl<'a, A, T, S, G> Walker<'a, A, T, S, G>
where
    A: AgentInvoker,
    T: TemplateLoader,
    S: Scaffolder,
    G: GitOps,
{
    pub fn new(
        paths: &'a ProjectPaths,
        config: &'a PipelineConfig,
        deps: Collaborators<'a, A, T, S, G>,
        state: PipelineState,
    ) -> Self {
        Self {
            paths,
            config,
            deps,
            state,
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn into_state(self) -> PipelineState {
        self.state
    }

    /// Walk every milestone in lexical order until done or halted.
    #[instrument(skip_all, fields(project = %self.state.project_name))]
    pub fn run(&mut self) -> Result<WalkOutcome> {
        let milestone_ids: Vec<String> = self.state.milestones.keys().cloned().collect();
        for milestone_id in milestone_ids {
            if self.milestone(&milestone_id)?.status == SpecStatus::Completed {
                continue;
            }
            if self.state.current_milestone_id.as_deref() != Some(milestone_id.as_str()) {
                self.state.current_milestone_id = Some(milestone_id.clone());
                self.checkpoint("enter milestone")?;
            }
            if let Flow::Halted { phase_id } = self.walk_milestone(&milestone_id)? {
                info!(
                    milestone = %milestone_id,
                    phase = %phase_id,
                    "phase complete, stopping for review"
                );
                return Ok(WalkOutcome::Halted {
                    milestone_id,
                    phase_id,
                });
            }
        }

        self.state.current_milestone_id = None;
        self.checkpoint("pipeline finished")?;
        info!("all milestones completed");
        Ok(WalkOutcome::Finished)
    }

    #[instrument(skip_all, fields(milestone = milestone_id))]
    fn walk_milestone(&mut self, milestone_id: &str) -> Result<Flow> {
        let unit = UnitRef {
            level: "milestone",
            unit_path: milestone_id.to_string(),
            dir: self.paths.milestone_dir(milestone_id),
            parent_dir: None,
        };

        if self.milestone(milestone_id)?.status == SpecStatus::Pending {
            transition(self.milestone_mut(milestone_id)?, SpecStatus::Planning)?;
            self.checkpoint("milestone planning")?;
        }
        if self.milestone(milestone_id)?.status == SpecStatus::Planning {
            let outcome = self.planning_cycle(
                &unit,
                ArtifactNames::SPEC,
                "milestone spec",
                self.config.limits.milestone,
            )?;
            let milestone = self.milestone_mut(milestone_id)?;
            milestone.planning.record(
                outcome.iterations_used,
                outcome.tiebreaker_used,
                outcome.already_locked,
            );
            transition(milestone, SpecStatus::SpecLocked)?;
            self.checkpoint("milestone spec locked")?;
        }
        if self.milestone(milestone_id)?.status == SpecStatus::SpecLocked {
            self.deps
                .scaffolder
                .expand_phases(&unit.dir, &mut self.state, milestone_id)?;
            self.checkpoint("phases scaffolded")?;
            transition(self.milestone_mut(milestone_id)?, SpecStatus::InProgress)?;
            self.checkpoint("milestone in progress")?;
        }
        if self.milestone(milestone_id)?.status == SpecStatus::InProgress {
            let phase_ids: Vec<String> = self
                .milestone(milestone_id)?
                .phases
                .keys()
                .cloned()
                .collect();
            if phase_ids.is_empty() {
                return Err(anyhow!(
                    "milestone {milestone_id} is in_progress but has no phases"
                ));
            }
            for phase_id in phase_ids {
                if self.phase(milestone_id, &phase_id)?.status == SpecStatus::Completed {
                    continue;
                }
                let milestone = self.milestone_mut(milestone_id)?;
                if milestone.current_phase_id.as_deref() != Some(phase_id.as_str()) {
                    milestone.current_phase_id = Some(phase_id.clone());
                    self.checkpoint("enter phase")?;
                }
                if let halted @ Flow::Halted { .. } = self.walk_phase(milestone_id, &phase_id)? {
                    return Ok(halted);
                }
            }
            transition(self.milestone_mut(milestone_id)?, SpecStatus::Completed)?;
            self.checkpoint("milestone completed")?;
        }
        Ok(Flow::Continue)
    }

    #[instrument(skip_all, fields(phase = phase_id))]
    fn walk_phase(&mut self, milestone_id: &str, phase_id: &str) -> Result<Flow> {
        let unit = UnitRef {
            level: "phase",
            unit_path: format!("{milestone_id}/{phase_id}"),
            dir: self.paths.phase_dir(milestone_id, phase_id),
            parent_dir: Some(self.paths.milestone_dir(milestone_id)),
        };

        if self.phase(milestone_id, phase_id)?.status == SpecStatus::Pending {
            transition(self.phase_mut(milestone_id, phase_id)?, SpecStatus::Planning)?;
            self.checkpoint("phase planning")?;
        }
        if self.phase(milestone_id, phase_id)?.status == SpecStatus::Planning {
            let outcome = self.planning_cycle(
                &unit,
                ArtifactNames::SPEC,
                "phase spec",
                self.config.limits.phase,
            )?;
            let phase = self.phase_mut(milestone_id, phase_id)?;
            phase.planning.record(
                outcome.iterations_used,
                outcome.tiebreaker_used,
                outcome.already_locked,
            );
            transition(phase, SpecStatus::SpecLocked)?;
            self.checkpoint("phase spec locked")?;
        }
        if self.phase(milestone_id, phase_id)?.status == SpecStatus::SpecLocked {
            self.deps
                .scaffolder
                .expand_tasks(&unit.dir, &mut self.state, milestone_id, phase_id)?;
            self.checkpoint("tasks scaffolded")?;
            self.git_step("create phase branch", |git| {
                git.create_phase_branch(milestone_id, phase_id)
            });
            transition(self.phase_mut(milestone_id, phase_id)?, SpecStatus::InProgress)?;
            self.checkpoint("phase in progress")?;
        }
        if self.phase(milestone_id, phase_id)?.status == SpecStatus::InProgress {
            let task_ids: Vec<String> = self
                .phase(milestone_id, phase_id)?
                .tasks
                .keys()
                .cloned()
                .collect();
            if task_ids.is_empty() {
                return Err(anyhow!(
                    "phase {milestone_id}/{phase_id} is in_progress but has no tasks"
                ));
            }
            for task_id in task_ids {
                if self.task(milestone_id, phase_id, &task_id)?.status == TaskStatus::Completed {
                    continue;
                }
                let phase = self.phase_mut(milestone_id, phase_id)?;
                if phase.current_task_id.as_deref() != Some(task_id.as_str()) {
                    phase.current_task_id = Some(task_id.clone());
                    self.checkpoint("enter task")?;
                }
                self.walk_task(milestone_id, phase_id, &task_id)?;
            }

            transition(self.phase_mut(milestone_id, phase_id)?, SpecStatus::Completed)?;
            self.checkpoint("phase completed")?;
            self.git_step("create pull request", |git| {
                git.create_phase_pr(milestone_id, phase_id)
            });
            self.git_step("return to main", |git| git.return_to_main());
            self.checkpoint("phase review gate")?;
            if self.config.git.enabled {
                return Ok(Flow::Halted {
                    phase_id: phase_id.to_string(),
                });
            }
        }
        Ok(Flow::Continue)
    }

    #[instrument(skip_all, fields(task = task_id))]
    fn walk_task(&mut self, milestone_id: &str, phase_id: &str, task_id: &str) -> Result<()> {
        let unit = UnitRef {
            level: "task",
            unit_path: format!("{milestone_id}/{phase_id}/{task_id}"),
            dir: self.paths.task_dir(milestone_id, phase_id, task_id),
            parent_dir: Some(self.paths.phase_dir(milestone_id, phase_id)),
        };

        if self.task(milestone_id, phase_id, task_id)?.status == TaskStatus::Pending {
            transition(self.task_mut(milestone_id, phase_id, task_id)?, TaskStatus::Planning)?;
            self.checkpoint("task planning")?;
        }
        if self.task(milestone_id, phase_id, task_id)?.status == TaskStatus::Planning {
            let outcome = self.planning_cycle(
                &unit,
                ArtifactNames::PLAN,
                "task plan",
                self.config.limits.task_plan,
            )?;
            let task = self.task_mut(milestone_id, phase_id, task_id)?;
            task.planning.record(
                outcome.iterations_used,
                outcome.tiebreaker_used,
                outcome.already_locked,
            );
            transition(task, TaskStatus::PlanLocked)?;
            self.checkpoint("task plan locked")?;
        }
        if self.task(milestone_id, phase_id, task_id)?.status == TaskStatus::PlanLocked {
            transition(
                self.task_mut(milestone_id, phase_id, task_id)?,
                TaskStatus::Implementing,
            )?;
            self.checkpoint("task implementing")?;
        }
        if self.task(milestone_id, phase_id, task_id)?.status == TaskStatus::Implementing {
            let outcome = self.implementation_cycle(&unit)?;
            let task = self.task_mut(milestone_id, phase_id, task_id)?;
            task.implementation.record(
                outcome.iterations_used,
                outcome.tiebreaker_used,
                outcome.already_locked,
            );
            transition(task, TaskStatus::Completed)?;
            self.checkpoint("task completed")?;
            self.git_step("commit task", |git| {
                git.commit_task_completion(milestone_id, phase_id, task_id)
            });
        }
        Ok(())
    }

    fn planning_cycle(
        &self,
        unit: &UnitRef,
        names: ArtifactNames,
        artifact_kind: &str,
        max_iterations: u32,
    ) -> Result<CycleOutcome> {
        let roles = &self.config.roles;
        let ctx = CycleContext {
            label: format!("{} {artifact_kind}", unit.unit_path),
            roles: CycleRoles {
                creator: Role::from_config("planner", &roles.planner),
                challenger: Role::from_config("challenger", &roles.challenger),
                tiebreaker: Role::from_config("tiebreaker", &roles.tiebreaker),
            },
            max_iterations,
            templates: StageTemplates::PLANNING,
            artifact_dir: unit.dir.clone(),
            workdir: self.paths.root.clone(),
            vars: self.unit_vars(unit, artifact_kind),
            names,
        };
        run_cycle(self.deps.agent, self.deps.templates, &ctx)
    }

    fn implementation_cycle(&self, unit: &UnitRef) -> Result<CycleOutcome> {
        let roles = &self.config.roles;
        let implementer = Role::from_config("implementer", &roles.implementer);
        // The implementation tiebreaker edits the working tree like the implementer.
        let tiebreaker = Role {
            options: implementer.options.clone(),
            ..Role::from_config("tiebreaker", &roles.tiebreaker)
        };
        let mut vars = self.unit_vars(unit, "implementation notes");
        vars.insert(
            "plan_path".into(),
            json!(self.paths.relative(&unit.dir.join(ArtifactNames::PLAN.locked))),
        );
        let ctx = CycleContext {
            label: format!("{} implementation", unit.unit_path),
            roles: CycleRoles {
                creator: implementer,
                challenger: Role::from_config("reviewer", &roles.reviewer),
                tiebreaker,
            },
            max_iterations: self.config.limits.task_impl,
            templates: StageTemplates::IMPLEMENTATION,
            artifact_dir: unit.dir.clone(),
            workdir: self.paths.root.clone(),
            vars,
            names: ArtifactNames::IMPLEMENTATION,
        };
        run_cycle(self.deps.agent, self.deps.templates, &ctx)
    }

    fn unit_vars(&self, unit: &UnitRef, artifact_kind: &str) -> TemplateVars {
        let mut vars = TemplateVars::new();
        vars.insert("project".into(), json!(self.state.project_name));
        vars.insert("level".into(), json!(unit.level));
        vars.insert("unit_path".into(), json!(unit.unit_path));
        vars.insert("artifact_kind".into(), json!(artifact_kind));
        vars.insert(
            "spec_path".into(),
            json!(self.paths.relative(&unit.dir.join(SPEC))),
        );
        if let Some(parent) = &unit.parent_dir {
            vars.insert(
                "parent_spec_path".into(),
                json!(self.paths.relative(&parent.join(LOCKED_SPEC))),
            );
        }
        vars
    }

    /// Run a git action if integration is enabled. Failures are logged, never fatal.
    fn git_step(&self, action: &str, op: impl FnOnce(&G) -> Result<()>) {
        if !self.config.git.enabled {
            return;
        }
        if self.config.dry_run {
            info!(action, "dry run: skipping git");
            return;
        }
        if let Err(err) = op(self.deps.git) {
            warn!(action, err = %format!("{err:#}"), "git step failed, continuing");
        }
    }

    fn checkpoint(&self, label: &str) -> Result<()> {
        checkpoint(&self.paths.state_path, &self.state, label)
    }

    fn milestone(&self, milestone_id: &str) -> Result<&MilestoneState> {
        self.state
            .milestones
            .get(milestone_id)
            .with_context(|| format!("milestone {milestone_id} missing from state"))
    }

    fn milestone_mut(&mut self, milestone_id: &str) -> Result<&mut MilestoneState> {
        self.state
            .milestones
            .get_mut(milestone_id)
            .with_context(|| format!("milestone {milestone_id} missing from state"))
    }

    fn phase(&self, milestone_id: &str, phase_id: &str) -> Result<&PhaseState> {
        self.milestone(milestone_id)?
            .phases
            .get(phase_id)
            .with_context(|| format!("phase {milestone_id}/{phase_id} missing from state"))
    }

    fn phase_mut(&mut self, milestone_id: &str, phase_id: &str) -> Result<&mut PhaseState> {
        self.milestone_mut(milestone_id)?
            .phases
            .get_mut(phase_id)
            .with_context(|| format!("phase {milestone_id}/{phase_id} missing from state"))
    }

    fn task(&self, milestone_id: &str, phase_id: &str, task_id: &str) -> Result<&TaskState> {
        self.phase(milestone_id, phase_id)?
            .tasks
            .get(task_id)
            .with_context(|| {
                format!("task {milestone_id}/{phase_id}/{task_id} missing from state")
            })
    }

    fn task_mut(
        &mut self,
        milestone_id: &str,
        phase_id: &str,
        task_id: &str,
    ) -> Result<&mut TaskState> {
        self.phase_mut(milestone_id, phase_id)?
            .tasks
            .get_mut(task_id)
            .with_context(|| {
                format!("task {milestone_id}/{phase_id}/{task_id} missing from state")
            })
    }
}

/// Load the state, walk it once and return how the run ended.
pub fn run_pipeline<A, T, S, G>(
    paths: &ProjectPaths,
    config: &PipelineConfig,
    deps: Collaborators<'_, A, T, S, G>,
) -> Result<WalkOutcome>
where
    A: AgentInvoker,
    T: TemplateLoader,
    S: Scaffolder,
    G: GitOps,
{
    if config.dry_run {
        // Placeholder artifacts must never reach the real project, where they
        // would look like locked work on the next run.
        let scratch = tempfile::Builder::new()
            .prefix("pipeline-dry-run-")
            .tempdir()
            .context("create dry-run scratch directory")?;
        let scratch_paths = paths.copy_to(scratch.path())?;
        info!(scratch = %scratch.path().display(), "dry run: walking a scratch copy");
        let state = load_state(&scratch_paths.state_path)?;
        return Walker::new(&scratch_paths, config, deps, state).run();
    }
    let state = load_state(&paths.state_path)?;
    Walker::new(paths, config, deps, state).run()
}
