//! Agent invocation.
//!
//! The [`AgentInvoker`] trait decouples the cycle engine from the agent CLIs it
//! drives. Tests use scripted invokers that return canned responses without
//! spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::decision::{Decision, DecisionError, Verdict, parse_decision};
use crate::io::artifact::write_atomic;
use crate::io::config::{AgentCommand, PipelineConfig, RoleConfig, SandboxMode};
use crate::io::process::run_command_with_timeout;

/// A named role resolved to an agent plus its call options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    /// Role name (`planner`, `challenger`, ...), used in logs.
    pub name: String,
    /// Key into the configured `[agents]` table.
    pub agent: String,
    pub options: CallOptions,
}

impl Role {
    pub fn from_config(name: &str, cfg: &RoleConfig) -> Self {
        Self {
            name: name.to_string(),
            agent: cfg.agent.clone(),
            options: CallOptions {
                allowed_tools: cfg.allowed_tools.clone(),
                sandbox: cfg.sandbox,
                expect_decision: false,
            },
        }
    }

    /// Same role, but the response must carry a verdict.
    pub fn expecting_decision(mut self) -> Self {
        self.options.expect_decision = true;
        self
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub allowed_tools: Vec<String>,
    pub sandbox: SandboxMode,
    /// Parse a [`Decision`] out of the response.
    pub expect_decision: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    pub raw_text: String,
    pub decision: Option<Decision>,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent '{agent}' for role {role} could not be started: {reason}")]
    Spawn {
        role: String,
        agent: String,
        reason: String,
    },
    #[error("agent '{agent}' for role {role} exited with status {code:?}: {stderr}")]
    Exit {
        role: String,
        agent: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("agent '{agent}' for role {role} timed out after {}s", .timeout.as_secs())]
    TimedOut {
        role: String,
        agent: String,
        timeout: Duration,
    },
    #[error(
        "agent '{agent}' for role {role} wrote more than {limit_bytes} bytes; the reply was cut off"
    )]
    OutputTruncated {
        role: String,
        agent: String,
        limit_bytes: usize,
    },
    #[error("agent '{agent}' for role {role} returned no usable decision: {source}")]
    MalformedDecision {
        role: String,
        agent: String,
        raw_text: String,
        #[source]
        source: DecisionError,
    },
}

/// Abstraction over agent backends.
pub trait AgentInvoker {
    /// Run `role` with `prompt`. Failures are fatal for the current run; there is
    /// no retry at this layer.
    fn call(&self, role: &Role, prompt: &str, options: &CallOptions) -> Result<AgentResponse>;
}

/// Invoker that spawns the configured agent CLI with the prompt on stdin.
pub struct CommandInvoker<'a> {
    config: &'a PipelineConfig,
    workdir: PathBuf,
    log_dir: PathBuf,
    seq: AtomicU64,
}

impl<'a> CommandInvoker<'a> {
    pub fn new(config: &'a PipelineConfig, workdir: PathBuf, log_dir: PathBuf) -> Self {
        Self {
            config,
            workdir,
            log_dir,
            seq: AtomicU64::new(1),
        }
    }

    fn build_command(agent: &AgentCommand, options: &CallOptions) -> Command {
        let mut cmd = Command::new(&agent.program);
        cmd.args(&agent.args);
        if let Some(flag) = &agent.tools_flag
            && !options.allowed_tools.is_empty()
        {
            cmd.arg(flag).arg(options.allowed_tools.join(","));
        }
        if let Some(flag) = &agent.sandbox_flag {
            cmd.arg(flag).arg(options.sandbox.as_str());
        }
        cmd.args(&agent.trailing_args);
        cmd
    }
}

impl AgentInvoker for CommandInvoker<'_> {
    #[instrument(skip_all, fields(role = %role.name, agent = %role.agent))]
    fn call(&self, role: &Role, prompt: &str, options: &CallOptions) -> Result<AgentResponse> {
        if self.config.dry_run {
            info!(prompt_bytes = prompt.len(), "dry run: skipping agent call");
            return Ok(dry_run_response(role, options));
        }

        let agent = self.config.agent_for(&role.agent)?;
        let mut cmd = Self::build_command(agent, options);
        cmd.current_dir(&self.workdir);

        let timeout = Duration::from_secs(self.config.agent_timeout_secs);
        let start = Instant::now();
        info!(prompt_bytes = prompt.len(), "invoking agent");
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            timeout,
            self.config.agent_output_limit_bytes,
        )
        .map_err(|err| AgentError::Spawn {
            role: role.name.clone(),
            agent: role.agent.clone(),
            reason: format!("{err:#}"),
        })?;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let log_path = self
            .log_dir
            .join(format!("{seq:04}-{}-{}.log", role.name, role.agent));
        write_atomic(&log_path, &output.render_log())
            .with_context(|| format!("write agent log {}", log_path.display()))?;

        if output.timed_out {
            return Err(AgentError::TimedOut {
                role: role.name.clone(),
                agent: role.agent.clone(),
                timeout,
            }
            .into());
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), log = %log_path.display(), "agent failed");
            return Err(AgentError::Exit {
                role: role.name.clone(),
                agent: role.agent.clone(),
                code: output.status.code(),
                stderr: output.stderr_tail(5),
            }
            .into());
        }

        if output.stdout_truncated > 0 {
            warn!(
                dropped_bytes = output.stdout_truncated,
                log = %log_path.display(),
                "agent reply exceeded the output limit"
            );
            return Err(AgentError::OutputTruncated {
                role: role.name.clone(),
                agent: role.agent.clone(),
                limit_bytes: self.config.agent_output_limit_bytes,
            }
            .into());
        }

        let raw_text = output.stdout_text();
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            response_bytes = raw_text.len(),
            "agent finished"
        );
        let decision = if options.expect_decision {
            Some(decode_decision(role, &raw_text)?)
        } else {
            None
        };
        Ok(AgentResponse { raw_text, decision })
    }
}

/// Parse a decision from `raw_text`, attributing failures to `role`.
pub fn decode_decision(role: &Role, raw_text: &str) -> Result<Decision, AgentError> {
    parse_decision(raw_text).map_err(|source| AgentError::MalformedDecision {
        role: role.name.clone(),
        agent: role.agent.clone(),
        raw_text: raw_text.to_string(),
        source,
    })
}

fn dry_run_response(role: &Role, options: &CallOptions) -> AgentResponse {
    if options.expect_decision {
        let decision = Decision {
            verdict: Verdict::Approved,
            feedback: "dry run".to_string(),
        };
        let raw_text = format!(
            "[dry run: {} not invoked]\n\n```json\n{}\n```\n",
            role.name,
            serde_json::json!({ "verdict": "approved", "feedback": "dry run" })
        );
        return AgentResponse {
            raw_text,
            decision: Some(decision),
        };
    }
    // One placeholder unit of each kind so a dry run can scaffold its way down.
    AgentResponse {
        raw_text: format!(
            "[dry run: {} not invoked]\n\n## Phase p01: dry run\n\n## Task t01: dry run\n",
            role.name
        ),
        decision: None,
    }
}
