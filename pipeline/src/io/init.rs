//! Project layout and `.pipeline/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument};

use super::artifact::write_atomic;
use super::config::{PipelineConfig, write_config};
use super::state_store::save_state;
use crate::core::ids::{check_id, check_sibling_widths};
use crate::state::PipelineState;

/// Input spec of every unit directory.
pub const SPEC: &str = "spec.md";
/// Locked spec of a milestone or phase; the scaffolder reads child headings from it.
pub const LOCKED_SPEC: &str = "spec-locked.md";

/// All canonical paths for a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub pipeline_dir: PathBuf,
    pub state_path: PathBuf,
    pub config_path: PathBuf,
    pub logs_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub milestones_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let pipeline_dir = root.join(".pipeline");
        Self {
            root: root.clone(),
            state_path: pipeline_dir.join("state.json"),
            config_path: pipeline_dir.join("config.toml"),
            logs_dir: pipeline_dir.join("logs"),
            gitignore_path: pipeline_dir.join(".gitignore"),
            milestones_dir: root.join("milestones"),
            pipeline_dir,
        }
    }

    pub fn milestone_dir(&self, milestone_id: &str) -> PathBuf {
        self.milestones_dir.join(milestone_id)
    }

    pub fn phase_dir(&self, milestone_id: &str, phase_id: &str) -> PathBuf {
        self.milestone_dir(milestone_id).join("phases").join(phase_id)
    }

    pub fn task_dir(&self, milestone_id: &str, phase_id: &str, task_id: &str) -> PathBuf {
        self.phase_dir(milestone_id, phase_id)
            .join("tasks")
            .join(task_id)
    }

    /// Prompt override directory, resolved against the project root.
    pub fn templates_dir(&self, config: &PipelineConfig) -> Option<PathBuf> {
        config.templates_dir.as_ref().map(|dir| self.root.join(dir))
    }

    /// Copy the state file, config and `milestones/` tree under `dest`.
    ///
    /// Logs and anything else in the project are left behind.
    pub fn copy_to(&self, dest: &Path) -> Result<ProjectPaths> {
        let copy = ProjectPaths::new(dest);
        fs::create_dir_all(&copy.pipeline_dir)
            .with_context(|| format!("create directory {}", copy.pipeline_dir.display()))?;
        fs::copy(&self.state_path, &copy.state_path)
            .with_context(|| format!("copy {}", self.state_path.display()))?;
        if self.config_path.is_file() {
            fs::copy(&self.config_path, &copy.config_path)
                .with_context(|| format!("copy {}", self.config_path.display()))?;
        }
        if self.milestones_dir.is_dir() {
            copy_tree(&self.milestones_dir, &copy.milestones_dir)?;
        }
        Ok(copy)
    }

    /// `path` relative to the project root, for prompts and logs.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

/// Options for `init_project`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub project: String,
    pub milestones: Vec<String>,
    /// If true, overwrite an existing state file and config.
    pub force: bool,
}

/// Create `.pipeline/` and one `milestones/<id>/spec.md` placeholder per milestone.
///
/// Milestone specs that already exist are never overwritten, even with `force`.
#[instrument(skip_all, fields(project = %options.project))]
pub fn init_project(root: &Path, options: &InitOptions) -> Result<ProjectPaths> {
    let paths = ProjectPaths::new(root);
    if paths.state_path.exists() && !options.force {
        return Err(anyhow!(
            "pipeline init: {} already exists (use --force to overwrite)",
            paths.state_path.display()
        ));
    }
    if options.milestones.is_empty() {
        return Err(anyhow!("pipeline init: at least one --milestone is required"));
    }
    let mut errors: Vec<String> = options
        .milestones
        .iter()
        .filter_map(|id| check_id(id))
        .collect();
    errors.extend(check_sibling_widths(options.milestones.iter().map(String::as_str)));
    if !errors.is_empty() {
        return Err(anyhow!("pipeline init: {}", errors.join("; ")));
    }

    let state = PipelineState::new(options.project.clone(), options.milestones.iter());
    if state.milestones.len() != options.milestones.len() {
        return Err(anyhow!("pipeline init: duplicate milestone ids"));
    }

    save_state(&paths.state_path, &state)?;
    write_config(&paths.config_path, &PipelineConfig::default())?;
    write_atomic(&paths.gitignore_path, PIPELINE_GITIGNORE)?;
    for id in state.milestones.keys() {
        let spec = paths.milestone_dir(id).join(SPEC);
        if !spec.exists() {
            write_atomic(&spec, &milestone_placeholder(id))?;
        }
    }

    info!(milestones = state.milestones.len(), "project initialized");
    Ok(paths)
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).with_context(|| format!("create directory {}", to.display()))?;
    let entries = fs::read_dir(from).with_context(|| format!("read directory {}", from.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read directory {}", from.display()))?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

fn milestone_placeholder(id: &str) -> String {
    format!("# Milestone {id}\n\nDescribe what this milestone must deliver.\n")
}

const PIPELINE_GITIGNORE: &str = "logs/\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;
    use crate::io::state_store::load_state;

    fn options(milestones: &[&str], force: bool) -> InitOptions {
        InitOptions {
            project: "demo".to_string(),
            milestones: milestones.iter().map(|m| m.to_string()).collect(),
            force,
        }
    }

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &options(&["m01", "m02"], false)).expect("init");

        let state = load_state(&paths.state_path).expect("load state");
        assert_eq!(state.project_name, "demo");
        assert_eq!(state.milestones.keys().collect::<Vec<_>>(), ["m01", "m02"]);
        assert_eq!(load_config(&paths.config_path).expect("config"), PipelineConfig::default());
        assert!(paths.milestone_dir("m02").join(SPEC).is_file());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            PIPELINE_GITIGNORE
        );
    }

    #[test]
    fn init_without_force_refuses_existing_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_project(temp.path(), &options(&["m01"], false)).expect("init");
        let err = init_project(temp.path(), &options(&["m01"], false)).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn force_keeps_existing_milestone_specs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &options(&["m01"], false)).expect("init");
        let spec = paths.milestone_dir("m01").join(SPEC);
        fs::write(&spec, "real content").expect("write");

        init_project(temp.path(), &options(&["m01"], true)).expect("re-init");
        assert_eq!(fs::read_to_string(&spec).expect("read"), "real content");
    }

    #[test]
    fn mixed_id_widths_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = init_project(temp.path(), &options(&["m1", "m10"], false)).unwrap_err();
        assert!(err.to_string().contains("different numeric widths"));
        assert!(!ProjectPaths::new(temp.path()).state_path.exists());
    }

    #[test]
    fn copy_to_carries_state_config_and_unit_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &options(&["m01"], false)).expect("init");
        let task = paths.task_dir("m01", "p01", "t01");
        fs::create_dir_all(&task).expect("mkdir");
        fs::write(task.join("plan-v1.md"), "plan").expect("write");
        fs::create_dir_all(&paths.logs_dir).expect("mkdir");
        fs::write(paths.logs_dir.join("0001-planner-claude.log"), "log").expect("write");

        let dest = tempfile::tempdir().expect("tempdir");
        let copy = paths.copy_to(dest.path()).expect("copy");
        assert_eq!(copy.root, dest.path());
        assert_eq!(
            load_state(&copy.state_path).expect("load"),
            load_state(&paths.state_path).expect("load")
        );
        assert!(copy.config_path.is_file());
        assert_eq!(
            fs::read_to_string(copy.task_dir("m01", "p01", "t01").join("plan-v1.md"))
                .expect("read"),
            "plan"
        );
        assert!(!copy.logs_dir.exists());
    }

    #[test]
    fn unit_dirs_nest_under_milestones() {
        let paths = ProjectPaths::new("/work");
        assert_eq!(
            paths.task_dir("m01", "p02", "t03"),
            Path::new("/work/milestones/m01/phases/p02/tasks/t03")
        );
        assert_eq!(
            paths.relative(&paths.phase_dir("m01", "p02")),
            "milestones/m01/phases/p02"
        );
    }
}
