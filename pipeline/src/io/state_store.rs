//! Workflow state storage (`.pipeline/state.json`).
//!
//! The whole document is rewritten on every save; writes are atomic so a crash
//! mid-write leaves the previous checkpoint intact.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use jsonschema::Validator;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::core::invariants::validate_invariants;
use crate::io::artifact::write_atomic;
use crate::state::PipelineState;

pub const STATE_SCHEMA: &str = include_str!("../../schemas/state.schema.json");

static VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(STATE_SCHEMA).expect("state schema is JSON");
    jsonschema::validator_for(&schema).expect("state schema compiles")
});

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {} not found (run `pipeline init` first)", .path.display())]
    NotFound { path: PathBuf },
    #[error(
        "state file {} is corrupt: {reason} (fix or restore it before re-running)",
        .path.display()
    )]
    Corrupt { path: PathBuf, reason: String },
}

/// Load state from disk, validating schema and invariants.
pub fn load_state(path: &Path) -> Result<PipelineState> {
    debug!(path = %path.display(), "loading state");
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(StateError::NotFound {
                path: path.to_path_buf(),
            }
            .into());
        }
        Err(err) => return Err(err).with_context(|| format!("read state {}", path.display())),
    };
    let state = parse_state(path, &contents)?;
    debug!(
        project = %state.project_name,
        milestones = state.milestones.len(),
        "state loaded"
    );
    Ok(state)
}

fn parse_state(path: &Path, contents: &str) -> Result<PipelineState, StateError> {
    let corrupt = |reason: String| StateError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let value: Value =
        serde_json::from_str(contents).map_err(|err| corrupt(format!("parse json: {err}")))?;
    let messages: Vec<String> = VALIDATOR
        .iter_errors(&value)
        .map(|e| e.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(corrupt(format!("schema: {}", messages.join("; "))));
    }
    let state: PipelineState =
        serde_json::from_value(value).map_err(|err| corrupt(format!("decode: {err}")))?;
    let errors = validate_invariants(&state);
    if !errors.is_empty() {
        return Err(corrupt(format!("invariants: {}", errors.join("; "))));
    }
    Ok(state)
}

/// Atomically write state to disk (temp file + rename).
pub fn save_state(path: &Path, state: &PipelineState) -> Result<()> {
    debug!(path = %path.display(), current = ?state.current_milestone_id, "writing state");
    let mut buf = serde_json::to_string_pretty(state).context("serialize state")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Save plus a structured event naming the step that caused it.
pub fn checkpoint(path: &Path, state: &PipelineState, label: &str) -> Result<()> {
    save_state(path, state).with_context(|| format!("checkpoint '{label}'"))?;
    info!(
        label,
        project = %state.project_name,
        milestone = state.current_milestone_id.as_deref().unwrap_or("-"),
        "checkpoint"
    );
    Ok(())
}
