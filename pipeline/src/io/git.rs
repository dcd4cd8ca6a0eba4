//! Git adapter for the phase branch / task commit / pull request flow.
//!
//! Every phase gets its own branch, every finished task becomes one commit on
//! it, and a finished phase is offered as a pull request before the run stops
//! for human review. The walker treats all of this as best-effort.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::config::GitConfig;

/// Side effects the walker triggers at unit boundaries.
pub trait GitOps {
    /// Switch to (creating if needed) the branch for a phase.
    fn create_phase_branch(&self, milestone_id: &str, phase_id: &str) -> Result<()>;
    /// Commit everything produced for a completed task.
    fn commit_task_completion(&self, milestone_id: &str, phase_id: &str, task_id: &str)
    -> Result<()>;
    /// Push the phase branch and open a pull request for it.
    fn create_phase_pr(&self, milestone_id: &str, phase_id: &str) -> Result<()>;
    /// Check out the main branch again.
    fn return_to_main(&self) -> Result<()>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Push `branch` to `origin`, setting upstream.
    #[instrument(skip_all, fields(branch))]
    pub fn push_upstream(&self, branch: &str) -> Result<()> {
        self.run_checked(&["push", "-u", "origin", branch])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// [`GitOps`] over the `git` and `gh` command-line tools.
#[derive(Debug, Clone)]
pub struct GitWorkflow {
    git: Git,
    config: GitConfig,
}

impl GitWorkflow {
    pub fn new(git: Git, config: GitConfig) -> Self {
        Self { git, config }
    }

    pub fn branch_name(&self, milestone_id: &str, phase_id: &str) -> String {
        format!("{}{milestone_id}-{phase_id}", self.config.branch_prefix)
    }
}

impl GitOps for GitWorkflow {
    #[instrument(skip_all, fields(milestone = milestone_id, phase = phase_id))]
    fn create_phase_branch(&self, milestone_id: &str, phase_id: &str) -> Result<()> {
        let branch = self.branch_name(milestone_id, phase_id);
        if self.git.current_branch()? == branch {
            return Ok(());
        }
        if self.git.branch_exists(&branch)? {
            self.git.checkout_branch(&branch)?;
        } else {
            self.git.checkout_new_branch(&branch)?;
        }
        info!(branch = %branch, "on phase branch");
        Ok(())
    }

    #[instrument(skip_all, fields(milestone = milestone_id, phase = phase_id, task = task_id))]
    fn commit_task_completion(
        &self,
        milestone_id: &str,
        phase_id: &str,
        task_id: &str,
    ) -> Result<()> {
        self.git.add_all()?;
        let message = format!("pipeline: complete task {milestone_id}/{phase_id}/{task_id}");
        if self.git.commit_staged(&message)? {
            info!("task committed");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(milestone = milestone_id, phase = phase_id))]
    fn create_phase_pr(&self, milestone_id: &str, phase_id: &str) -> Result<()> {
        if !self.config.create_pr {
            debug!("pull requests disabled");
            return Ok(());
        }
        let branch = self.branch_name(milestone_id, phase_id);
        self.git.push_upstream(&branch)?;

        let title = format!("Phase {milestone_id}/{phase_id}");
        let body = format!(
            "Automated pull request for phase `{phase_id}` of milestone `{milestone_id}`.\n\n\
             Locked specs, plans and implementation notes are under \
             `milestones/{milestone_id}/phases/{phase_id}/`.\n"
        );
        let output = Command::new("gh")
            .args(["pr", "create", "--base", &self.config.main_branch, "--head", &branch])
            .args(["--title", &title, "--body", &body])
            .current_dir(self.git.workdir())
            .output()
            .context("spawn gh pr create")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("gh pr create failed: {}", stderr.trim()));
        }
        info!(url = %String::from_utf8_lossy(&output.stdout).trim(), "pull request created");
        Ok(())
    }

    fn return_to_main(&self) -> Result<()> {
        self.git.checkout_branch(&self.config.main_branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn git(root: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(root)
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {args:?}");
    }

    fn init_git_repo(root: &Path) {
        git(root, &["init"]);
        git(root, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(root, &["config", "user.email", "test@example.com"]);
        git(root, &["config", "user.name", "test"]);
        fs::write(root.join("README.md"), "hi\n").expect("write");
        git(root, &["add", "README.md"]);
        git(root, &["commit", "-m", "chore: init"]);
    }

    fn workflow(root: &Path) -> GitWorkflow {
        GitWorkflow::new(Git::new(root), GitConfig::default())
    }

    #[test]
    fn branch_name_uses_prefix() {
        let wf = workflow(Path::new("."));
        assert_eq!(wf.branch_name("m01", "p02"), "pipeline/m01-p02");
    }

    #[test]
    fn phase_branch_commit_and_return() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        init_git_repo(root);
        let wf = workflow(root);

        wf.create_phase_branch("m01", "p01").expect("branch");
        assert_eq!(wf.git.current_branch().expect("branch"), "pipeline/m01-p01");
        // Re-entering the same phase is a no-op.
        wf.create_phase_branch("m01", "p01").expect("branch again");

        fs::write(root.join("notes.md"), "done\n").expect("write");
        wf.commit_task_completion("m01", "p01", "t01").expect("commit");
        assert!(!wf.git.has_staged_changes().expect("staged"));
        let log = wf.git.run_capture(&["log", "-1", "--format=%s"]).expect("log");
        assert_eq!(log.trim(), "pipeline: complete task m01/p01/t01");

        // Nothing new to commit is fine.
        wf.commit_task_completion("m01", "p01", "t02").expect("empty commit");

        wf.return_to_main().expect("main");
        assert_eq!(wf.git.current_branch().expect("branch"), "main");
        assert!(!root.join("notes.md").exists());
    }

    #[test]
    fn pr_is_skipped_when_disabled() {
        let config = GitConfig {
            create_pr: false,
            ..GitConfig::default()
        };
        let wf = GitWorkflow::new(Git::new("/nonexistent"), config);
        wf.create_phase_pr("m01", "p01").expect("skipped");
    }
}
