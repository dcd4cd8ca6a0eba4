//! Bounded draft → challenge → refine → tiebreak approval loop.
//!
//! One cycle produces one locked artifact for one unit of work. Every step is
//! keyed on the presence of its output file, so re-running a cycle after a
//! crash skips straight past finished steps and never pays for the same agent
//! call twice. The locked file is the cycle's commit point.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::decision::Decision;
use crate::io::agent::{AgentError, AgentInvoker, Role, decode_decision};
use crate::io::artifact::{copy_atomic, read_artifact, write_atomic};
use crate::io::templates::{TemplateLoader, TemplateVars};

/// File naming scheme for one kind of cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactNames {
    pub draft_prefix: &'static str,
    pub feedback_prefix: &'static str,
    pub tiebreak: &'static str,
    pub locked: &'static str,
}

impl ArtifactNames {
    /// Milestone and phase specs.
    pub const SPEC: Self = Self {
        draft_prefix: "spec",
        feedback_prefix: "feedback",
        tiebreak: "spec-tiebreak.md",
        locked: "spec-locked.md",
    };
    /// Task plans. Feedback shares the spec prefix; plan and spec never share a directory.
    pub const PLAN: Self = Self {
        draft_prefix: "plan",
        feedback_prefix: "feedback",
        tiebreak: "plan-tiebreak.md",
        locked: "plan-locked.md",
    };
    /// Task implementation notes and reviews.
    pub const IMPLEMENTATION: Self = Self {
        draft_prefix: "impl-notes",
        feedback_prefix: "review",
        tiebreak: "impl-tiebreak.md",
        locked: "impl-final.md",
    };

    pub fn draft(&self, iteration: u32) -> String {
        format!("{}-v{iteration}.md", self.draft_prefix)
    }

    pub fn feedback(&self, iteration: u32) -> String {
        format!("{}-v{iteration}.md", self.feedback_prefix)
    }
}

/// Template names for the four cycle steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTemplates {
    pub draft: &'static str,
    pub refine: &'static str,
    pub challenge: &'static str,
    pub tiebreak: &'static str,
}

impl StageTemplates {
    pub const PLANNING: Self = Self {
        draft: "draft",
        refine: "refine",
        challenge: "challenge",
        tiebreak: "tiebreak",
    };
    pub const IMPLEMENTATION: Self = Self {
        draft: "implement",
        refine: "implement-refine",
        challenge: "review",
        tiebreak: "implement-tiebreak",
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleRoles {
    pub creator: Role,
    pub challenger: Role,
    pub tiebreaker: Role,
}

/// Everything one cycle needs.
#[derive(Debug, Clone)]
pub struct CycleContext {
    /// Human-readable label for logs, e.g. `m01/p01 spec`.
    pub label: String,
    pub roles: CycleRoles,
    pub max_iterations: u32,
    pub templates: StageTemplates,
    pub artifact_dir: PathBuf,
    /// Artifact paths handed to agents are made relative to this directory.
    pub workdir: PathBuf,
    /// Unit-level variables; the engine adds the per-step ones.
    pub vars: TemplateVars,
    pub names: ArtifactNames,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Contents of the locked artifact.
    pub artifact: String,
    pub iterations_used: u32,
    pub tiebreaker_used: bool,
    /// The locked file existed before the cycle started; no work was done.
    pub already_locked: bool,
}

/// Run one approval cycle, resuming from whatever artifacts already exist.
#[instrument(skip_all, fields(cycle = %ctx.label))]
pub fn run_cycle<A: AgentInvoker, T: TemplateLoader>(
    agent: &A,
    templates: &T,
    ctx: &CycleContext,
) -> Result<CycleOutcome> {
    if ctx.max_iterations == 0 {
        return Err(anyhow!("{}: max_iterations must be > 0", ctx.label));
    }

    let locked_path = ctx.artifact_dir.join(ctx.names.locked);
    if locked_path.exists() {
        info!("locked artifact present, skipping cycle");
        return Ok(CycleOutcome {
            artifact: read_artifact(&locked_path)?,
            iterations_used: 0,
            tiebreaker_used: false,
            already_locked: true,
        });
    }

    let n = ctx.max_iterations;
    for i in 1..=n {
        let draft_path = ctx.artifact_dir.join(ctx.names.draft(i));
        if draft_path.exists() {
            debug!(iteration = i, "draft exists, skipping creator");
        } else {
            write_draft(agent, templates, ctx, i, &draft_path)?;
        }

        let feedback_path = ctx.artifact_dir.join(ctx.names.feedback(i));
        let decision = if feedback_path.exists() {
            debug!(iteration = i, "feedback exists, re-reading decision");
            let raw = read_artifact(&feedback_path)?;
            decode_decision(&ctx.roles.challenger, &raw)?
        } else {
            challenge(agent, templates, ctx, i, &draft_path, &feedback_path)?
        };

        if decision.is_approved() {
            let artifact = copy_atomic(&draft_path, &locked_path)?;
            info!(iteration = i, "draft approved and locked");
            return Ok(CycleOutcome {
                artifact,
                iterations_used: i,
                tiebreaker_used: false,
                already_locked: false,
            });
        }
        info!(iteration = i, max_iterations = n, "draft rejected");
    }

    let artifact = tiebreak(agent, templates, ctx, &locked_path)?;
    Ok(CycleOutcome {
        artifact,
        iterations_used: n,
        tiebreaker_used: true,
        already_locked: false,
    })
}

fn write_draft<A: AgentInvoker, T: TemplateLoader>(
    agent: &A,
    templates: &T,
    ctx: &CycleContext,
    iteration: u32,
    draft_path: &Path,
) -> Result<()> {
    let mut vars = step_vars(ctx, &ctx.roles.creator, iteration);
    vars.insert("draft_path".into(), rel(ctx, draft_path));
    let template = if iteration == 1 {
        ctx.templates.draft
    } else {
        let prev = iteration - 1;
        vars.insert(
            "previous_draft_path".into(),
            rel(ctx, &ctx.artifact_dir.join(ctx.names.draft(prev))),
        );
        vars.insert(
            "previous_feedback_path".into(),
            rel(ctx, &ctx.artifact_dir.join(ctx.names.feedback(prev))),
        );
        ctx.templates.refine
    };
    let prompt = templates.render(template, &vars)?;
    let response = agent.call(&ctx.roles.creator, &prompt, &ctx.roles.creator.options)?;
    write_atomic(draft_path, &response.raw_text)?;
    info!(iteration, template, "draft written");
    Ok(())
}

fn challenge<A: AgentInvoker, T: TemplateLoader>(
    agent: &A,
    templates: &T,
    ctx: &CycleContext,
    iteration: u32,
    draft_path: &Path,
    feedback_path: &Path,
) -> Result<Decision> {
    let role = ctx.roles.challenger.clone().expecting_decision();
    let mut vars = step_vars(ctx, &role, iteration);
    vars.insert("draft_path".into(), rel(ctx, draft_path));
    let prompt = templates.render(ctx.templates.challenge, &vars)?;

    let decoded = agent.call(&role, &prompt, &role.options).and_then(|response| {
        let decision = match response.decision {
            Some(decision) => decision,
            None => decode_decision(&role, &response.raw_text)?,
        };
        Ok((response.raw_text, decision))
    });
    let (raw_text, decision) = match decoded {
        Ok(pair) => pair,
        Err(err) => {
            if let Some(AgentError::MalformedDecision { raw_text, .. }) =
                err.downcast_ref::<AgentError>()
            {
                save_invalid(feedback_path, raw_text);
            }
            return Err(err);
        }
    };

    write_atomic(feedback_path, &raw_text)?;
    info!(iteration, verdict = ?decision.verdict, "feedback written");
    Ok(decision)
}

fn tiebreak<A: AgentInvoker, T: TemplateLoader>(
    agent: &A,
    templates: &T,
    ctx: &CycleContext,
    locked_path: &Path,
) -> Result<String> {
    let tiebreak_path = ctx.artifact_dir.join(ctx.names.tiebreak);
    if tiebreak_path.exists() {
        info!("tiebreak artifact present, locking it");
        return copy_atomic(&tiebreak_path, locked_path);
    }

    let n = ctx.max_iterations;
    let role = &ctx.roles.tiebreaker;
    let mut vars = step_vars(ctx, role, n);
    let drafts: Vec<Value> = (1..=n)
        .map(|i| rel(ctx, &ctx.artifact_dir.join(ctx.names.draft(i))))
        .collect();
    let feedbacks: Vec<Value> = (1..=n)
        .map(|i| rel(ctx, &ctx.artifact_dir.join(ctx.names.feedback(i))))
        .collect();
    vars.insert("drafts".into(), Value::Array(drafts));
    vars.insert("feedbacks".into(), Value::Array(feedbacks));
    vars.insert("attempts".into(), json!(n));

    let prompt = templates.render(ctx.templates.tiebreak, &vars)?;
    warn!(attempts = n, "no approval within the iteration limit, calling tiebreaker");
    let response = agent.call(role, &prompt, &role.options)?;
    write_atomic(&tiebreak_path, &response.raw_text)?;
    copy_atomic(&tiebreak_path, locked_path)
}

fn step_vars(ctx: &CycleContext, role: &Role, iteration: u32) -> TemplateVars {
    let mut vars = ctx.vars.clone();
    vars.insert("role".into(), json!(role.name));
    vars.insert("iteration".into(), json!(iteration));
    vars.insert("max_iterations".into(), json!(ctx.max_iterations));
    vars
}

fn rel(ctx: &CycleContext, path: &Path) -> Value {
    let shown = path.strip_prefix(&ctx.workdir).unwrap_or(path);
    json!(shown.display().to_string())
}

/// Keep an undecodable challenger reply for diagnosis, without making it the
/// feedback file the next run would trust.
fn save_invalid(feedback_path: &Path, raw_text: &str) {
    let mut name = feedback_path.as_os_str().to_os_string();
    name.push(".invalid");
    let invalid = PathBuf::from(name);
    match write_atomic(&invalid, raw_text) {
        Ok(()) => warn!(path = %invalid.display(), "saved undecodable challenger reply"),
        Err(err) => warn!(err = %format!("{err:#}"), "failed to save undecodable reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::templates::PromptTemplates;
    use crate::test_support::{ScriptedInvoker, test_role};
    use std::fs;

    fn context(dir: &Path, names: ArtifactNames, max_iterations: u32) -> CycleContext {
        CycleContext {
            label: "m01/p01/t01 plan".to_string(),
            roles: CycleRoles {
                creator: test_role("planner"),
                challenger: test_role("challenger"),
                tiebreaker: test_role("tiebreaker"),
            },
            max_iterations,
            templates: StageTemplates::PLANNING,
            artifact_dir: dir.to_path_buf(),
            workdir: dir.to_path_buf(),
            vars: TemplateVars::new(),
            names,
        }
    }

    fn read(dir: &Path, name: &str) -> String {
        fs::read_to_string(dir.join(name)).expect("read artifact")
    }

    #[test]
    fn approval_on_first_iteration_locks_the_draft() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ScriptedInvoker::new().text("plan one").approve("ship it");
        let ctx = context(temp.path(), ArtifactNames::PLAN, 3);

        let outcome = run_cycle(&agent, &PromptTemplates::new(None), &ctx).expect("cycle");

        assert_eq!(outcome.iterations_used, 1);
        assert!(!outcome.tiebreaker_used);
        assert_eq!(outcome.artifact, "plan one");
        assert_eq!(read(temp.path(), "plan-locked.md"), "plan one");
        assert!(temp.path().join("feedback-v1.md").exists());
        assert_eq!(agent.roles(), ["planner", "challenger"]);
        let decisions: Vec<bool> = agent.calls().iter().map(|c| c.expect_decision).collect();
        assert_eq!(decisions, [false, true]);
    }

    #[test]
    fn third_draft_approved_after_two_rejections() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ScriptedInvoker::new()
            .text("draft 1")
            .reject("too vague")
            .text("draft 2")
            .reject("still vague")
            .text("draft 3")
            .approve("good");
        let ctx = context(temp.path(), ArtifactNames::IMPLEMENTATION, 3);

        let outcome = run_cycle(&agent, &PromptTemplates::new(None), &ctx).expect("cycle");

        assert_eq!(outcome.iterations_used, 3);
        assert!(!outcome.tiebreaker_used);
        assert_eq!(read(temp.path(), "impl-final.md"), "draft 3");
        assert!(temp.path().join("review-v2.md").exists());
        assert!(!temp.path().join("impl-tiebreak.md").exists());
        // The refine prompt points at the rejected draft and its feedback.
        let calls = agent.calls();
        assert!(calls[2].prompt.contains("impl-notes-v1.md"));
        assert!(calls[2].prompt.contains("review-v1.md"));
    }

    #[test]
    fn n_rejections_call_the_tiebreaker_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ScriptedInvoker::new()
            .text("draft 1")
            .reject("no")
            .text("draft 2")
            .reject("no")
            .text("final word");
        let ctx = context(temp.path(), ArtifactNames::SPEC, 2);

        let outcome = run_cycle(&agent, &PromptTemplates::new(None), &ctx).expect("cycle");

        assert_eq!(outcome.iterations_used, 2);
        assert!(outcome.tiebreaker_used);
        assert_eq!(read(temp.path(), "spec-tiebreak.md"), "final word");
        assert_eq!(read(temp.path(), "spec-locked.md"), "final word");
        let roles = agent.roles();
        assert_eq!(roles.iter().filter(|r| *r == "tiebreaker").count(), 1);
        let tiebreak_prompt = &agent.calls()[4].prompt;
        assert!(tiebreak_prompt.contains("spec-v1.md"));
        assert!(tiebreak_prompt.contains("feedback-v2.md"));
    }

    #[test]
    fn existing_locked_file_short_circuits() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("spec-locked.md"), "already done").expect("write");
        let agent = ScriptedInvoker::new();
        let ctx = context(temp.path(), ArtifactNames::SPEC, 3);

        let outcome = run_cycle(&agent, &PromptTemplates::new(None), &ctx).expect("cycle");

        assert_eq!(
            outcome,
            CycleOutcome {
                artifact: "already done".to_string(),
                iterations_used: 0,
                tiebreaker_used: false,
                already_locked: true,
            }
        );
        assert!(agent.calls().is_empty());
    }

    #[test]
    fn resume_reuses_existing_draft_and_feedback() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        fs::write(dir.join("plan-v1.md"), "draft 1").expect("write");
        fs::write(
            dir.join("feedback-v1.md"),
            "```json\n{\"verdict\":\"rejected\",\"feedback\":\"more\"}\n```\n",
        )
        .expect("write");
        fs::write(dir.join("plan-v2.md"), "draft 2").expect("write");
        // Crash happened after draft 2; only the challenge for iteration 2 is left.
        let agent = ScriptedInvoker::new().approve("fine");
        let ctx = context(dir, ArtifactNames::PLAN, 3);

        let outcome = run_cycle(&agent, &PromptTemplates::new(None), &ctx).expect("cycle");

        assert_eq!(outcome.iterations_used, 2);
        assert_eq!(outcome.artifact, "draft 2");
        assert_eq!(agent.roles(), ["challenger"]);
    }

    #[test]
    fn existing_approving_feedback_locks_without_calls() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        fs::write(dir.join("spec-v1.md"), "draft 1").expect("write");
        fs::write(
            dir.join("feedback-v1.md"),
            "{\"verdict\":\"approved\",\"feedback\":\"ok\"}",
        )
        .expect("write");
        let agent = ScriptedInvoker::new();
        let ctx = context(dir, ArtifactNames::SPEC, 3);

        let outcome = run_cycle(&agent, &PromptTemplates::new(None), &ctx).expect("cycle");

        assert_eq!(outcome.iterations_used, 1);
        assert!(!outcome.already_locked);
        assert_eq!(read(dir, "spec-locked.md"), "draft 1");
        assert!(agent.calls().is_empty());
    }

    #[test]
    fn existing_tiebreak_file_is_reused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        let rejected = "{\"verdict\":\"rejected\",\"feedback\":\"no\"}";
        fs::write(dir.join("spec-v1.md"), "d1").expect("write");
        fs::write(dir.join("feedback-v1.md"), rejected).expect("write");
        fs::write(dir.join("spec-tiebreak.md"), "decided").expect("write");
        let agent = ScriptedInvoker::new();
        let ctx = context(dir, ArtifactNames::SPEC, 1);

        let outcome = run_cycle(&agent, &PromptTemplates::new(None), &ctx).expect("cycle");

        assert!(outcome.tiebreaker_used);
        assert_eq!(outcome.artifact, "decided");
        assert!(agent.calls().is_empty());
    }

    #[test]
    fn malformed_decision_is_fatal_and_not_persisted_as_feedback() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        let agent = ScriptedInvoker::new().text("draft 1").text("looks fine to me");
        let ctx = context(dir, ArtifactNames::SPEC, 3);

        let err = run_cycle(&agent, &PromptTemplates::new(None), &ctx).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::MalformedDecision { .. })
        ));
        assert!(dir.join("spec-v1.md").exists());
        assert!(!dir.join("feedback-v1.md").exists());
        assert_eq!(read(dir, "feedback-v1.md.invalid"), "looks fine to me");
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path(), ArtifactNames::SPEC, 0);
        let err = run_cycle(&ScriptedInvoker::new(), &PromptTemplates::new(None), &ctx)
            .unwrap_err();
        assert!(err.to_string().contains("max_iterations must be > 0"));
    }
}
