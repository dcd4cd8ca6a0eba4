//! Pipeline configuration stored under `.pipeline/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::artifact::write_atomic;

/// Pipeline configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// working values; the config is passed explicitly to every component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Render prompts and walk a scratch copy of the project without spawning
    /// agents or touching git.
    pub dry_run: bool,

    /// Hard wall-clock limit for a single agent invocation.
    pub agent_timeout_secs: u64,

    /// Cap on captured agent stdout/stderr. A reply over the cap is an error.
    pub agent_output_limit_bytes: usize,

    /// Directory with `<name>.md` prompt overrides, relative to the project root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub templates_dir: Option<PathBuf>,

    pub limits: IterationLimits,
    pub roles: RoleTable,
    pub agents: BTreeMap<String, AgentCommand>,
    pub git: GitConfig,
}

/// Maximum approval iterations before the tiebreaker is called.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IterationLimits {
    pub milestone: u32,
    pub phase: u32,
    pub task_plan: u32,
    pub task_impl: u32,
}

impl Default for IterationLimits {
    fn default() -> Self {
        Self {
            milestone: 3,
            phase: 3,
            task_plan: 3,
            task_impl: 5,
        }
    }
}

/// Which agent plays each role, and with which call options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RoleTable {
    pub planner: RoleConfig,
    pub challenger: RoleConfig,
    pub tiebreaker: RoleConfig,
    pub implementer: RoleConfig,
    pub reviewer: RoleConfig,
}

impl Default for RoleTable {
    fn default() -> Self {
        Self {
            planner: RoleConfig::new("claude", SandboxMode::ReadOnly, &["Read", "Grep", "Glob"]),
            challenger: RoleConfig::new("codex", SandboxMode::ReadOnly, &[]),
            tiebreaker: RoleConfig::new("claude", SandboxMode::ReadOnly, &["Read", "Grep", "Glob"]),
            implementer: RoleConfig::new(
                "claude",
                SandboxMode::WorkspaceWrite,
                &["Read", "Grep", "Glob", "Edit", "Write", "Bash"],
            ),
            reviewer: RoleConfig::new("codex", SandboxMode::ReadOnly, &[]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleConfig {
    /// Key into `[agents]`.
    pub agent: String,
    #[serde(default)]
    pub sandbox: SandboxMode,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

impl RoleConfig {
    fn new(agent: &str, sandbox: SandboxMode, tools: &[&str]) -> Self {
        Self {
            agent: agent.to_string(),
            sandbox,
            allowed_tools: tools.iter().map(|t| t.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    #[default]
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

impl SandboxMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxMode::ReadOnly => "read-only",
            SandboxMode::WorkspaceWrite => "workspace-write",
            SandboxMode::DangerFullAccess => "danger-full-access",
        }
    }
}

/// How to spawn an agent CLI. The prompt is written to stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Flag preceding a comma-separated tool allow-list (omitted when the list is empty).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_flag: Option<String>,
    /// Flag preceding the sandbox mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_flag: Option<String>,
    /// Arguments appended after all generated flags (e.g. `-` for stdin).
    #[serde(default)]
    pub trailing_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    /// Enables branch/commit/PR automation and the stop-after-phase review gate.
    pub enabled: bool,
    pub main_branch: String,
    pub branch_prefix: String,
    pub create_pr: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            main_branch: "main".to_string(),
            branch_prefix: "pipeline/".to_string(),
            create_pr: true,
        }
    }
}

fn default_agents() -> BTreeMap<String, AgentCommand> {
    let mut agents = BTreeMap::new();
    agents.insert(
        "claude".to_string(),
        AgentCommand {
            program: "claude".to_string(),
            args: vec!["-p".to_string()],
            tools_flag: Some("--allowedTools".to_string()),
            sandbox_flag: None,
            trailing_args: Vec::new(),
        },
    );
    agents.insert(
        "codex".to_string(),
        AgentCommand {
            program: "codex".to_string(),
            args: vec!["exec".to_string(), "--skip-git-repo-check".to_string()],
            tools_flag: None,
            sandbox_flag: Some("--sandbox".to_string()),
            trailing_args: vec!["-".to_string()],
        },
    );
    agents
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            agent_timeout_secs: 30 * 60,
            agent_output_limit_bytes: 1_000_000,
            templates_dir: None,
            limits: IterationLimits::default(),
            roles: RoleTable::default(),
            agents: default_agents(),
            git: GitConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent_timeout_secs == 0 {
            return Err(anyhow!("agent_timeout_secs must be > 0"));
        }
        if self.agent_output_limit_bytes == 0 {
            return Err(anyhow!("agent_output_limit_bytes must be > 0"));
        }
        for (name, limit) in [
            ("milestone", self.limits.milestone),
            ("phase", self.limits.phase),
            ("task_plan", self.limits.task_plan),
            ("task_impl", self.limits.task_impl),
        ] {
            if limit == 0 {
                return Err(anyhow!("limits.{name} must be > 0"));
            }
        }
        for (role, cfg) in self.roles.iter() {
            let Some(agent) = self.agents.get(&cfg.agent) else {
                return Err(anyhow!(
                    "roles.{role}.agent '{}' is not defined under [agents]",
                    cfg.agent
                ));
            };
            if agent.program.trim().is_empty() {
                return Err(anyhow!("agents.{}.program must be non-empty", cfg.agent));
            }
        }
        if self.git.main_branch.trim().is_empty() {
            return Err(anyhow!("git.main_branch must be non-empty"));
        }
        Ok(())
    }

    /// Resolve an `[agents]` entry by name.
    pub fn agent_for(&self, agent: &str) -> Result<&AgentCommand> {
        self.agents
            .get(agent)
            .ok_or_else(|| anyhow!("agent '{agent}' is not defined under [agents]"))
    }
}

impl RoleTable {
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &RoleConfig)> {
        [
            ("planner", &self.planner),
            ("challenger", &self.challenger),
            ("tiebreaker", &self.tiebreaker),
            ("implementer", &self.implementer),
            ("reviewer", &self.reviewer),
        ]
        .into_iter()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
