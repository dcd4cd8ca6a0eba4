//! Child-unit generation from a locked parent spec.
//!
//! A locked milestone spec lists its phases as `Phase <id>: <title>` headings;
//! a locked phase spec lists its tasks as `Task <id>: <title>` headings. Each
//! heading becomes a child directory with its own `spec.md` and a `pending`
//! entry in the state.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::core::ids::{check_id, check_sibling_widths};
use crate::io::artifact::{read_artifact, write_atomic};
use crate::io::init::{LOCKED_SPEC, SPEC};
use crate::state::{PhaseState, PipelineState, TaskState};

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(#{1,6})[ \t]+(Phase|Task)[ \t]+([^\s:]+)[ \t]*(?::[ \t]*(.*?))?[ \t]*$")
        .expect("heading regex")
});

#[derive(Debug, Error)]
pub enum ScaffoldError {
    #[error(
        "no {kind} headings found in {} (expected `## {heading} <id>: <title>`)",
        .source_path.display()
    )]
    NoUnits {
        kind: &'static str,
        heading: &'static str,
        source_path: std::path::PathBuf,
    },
    #[error("duplicate {kind} id '{id}' in {}", .source_path.display())]
    DuplicateId {
        kind: &'static str,
        id: String,
        source_path: std::path::PathBuf,
    },
    #[error("{kind} heading in {}: {reason}", .source_path.display())]
    InvalidId {
        kind: &'static str,
        reason: String,
        source_path: std::path::PathBuf,
    },
}

/// Materializes child units once a parent spec locks.
pub trait Scaffolder {
    fn expand_phases(
        &self,
        milestone_dir: &Path,
        state: &mut PipelineState,
        milestone_id: &str,
    ) -> Result<()>;

    fn expand_tasks(
        &self,
        phase_dir: &Path,
        state: &mut PipelineState,
        milestone_id: &str,
        phase_id: &str,
    ) -> Result<()>;
}

/// One unit extracted from a locked spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub id: String,
    pub title: String,
    pub body: String,
}

/// Scaffolder that reads `Phase`/`Task` markdown headings.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadingScaffolder;

impl Scaffolder for HeadingScaffolder {
    #[instrument(skip_all, fields(milestone = milestone_id))]
    fn expand_phases(
        &self,
        milestone_dir: &Path,
        state: &mut PipelineState,
        milestone_id: &str,
    ) -> Result<()> {
        let units = read_units(milestone_dir, UnitKind::Phase)?;
        let milestone = state
            .milestones
            .get_mut(milestone_id)
            .with_context(|| format!("milestone '{milestone_id}' missing from state"))?;
        check_widths_with_existing(
            milestone.phases.keys(),
            &units,
            UnitKind::Phase,
            milestone_dir,
        )?;
        for unit in &units {
            write_child_spec(&milestone_dir.join("phases").join(&unit.id), unit)?;
            milestone.phases.entry(unit.id.clone()).or_insert_with(PhaseState::default);
        }
        info!(count = units.len(), "phases scaffolded");
        Ok(())
    }

    #[instrument(skip_all, fields(milestone = milestone_id, phase = phase_id))]
    fn expand_tasks(
        &self,
        phase_dir: &Path,
        state: &mut PipelineState,
        milestone_id: &str,
        phase_id: &str,
    ) -> Result<()> {
        let units = read_units(phase_dir, UnitKind::Task)?;
        let phase = state
            .milestones
            .get_mut(milestone_id)
            .and_then(|m| m.phases.get_mut(phase_id))
            .with_context(|| format!("phase '{milestone_id}/{phase_id}' missing from state"))?;
        check_widths_with_existing(phase.tasks.keys(), &units, UnitKind::Task, phase_dir)?;
        for unit in &units {
            write_child_spec(&phase_dir.join("tasks").join(&unit.id), unit)?;
            phase.tasks.entry(unit.id.clone()).or_insert_with(TaskState::default);
        }
        info!(count = units.len(), "tasks scaffolded");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Phase,
    Task,
}

impl UnitKind {
    fn heading(self) -> &'static str {
        match self {
            UnitKind::Phase => "Phase",
            UnitKind::Task => "Task",
        }
    }

    fn kind(self) -> &'static str {
        match self {
            UnitKind::Phase => "phase",
            UnitKind::Task => "task",
        }
    }
}

/// New siblings must share the numeric width of children already in the state.
fn check_widths_with_existing<'a>(
    existing: impl Iterator<Item = &'a String>,
    units: &'a [Unit],
    kind: UnitKind,
    parent_dir: &Path,
) -> Result<(), ScaffoldError> {
    let ids: BTreeSet<&str> = existing
        .map(String::as_str)
        .chain(units.iter().map(|u| u.id.as_str()))
        .collect();
    match check_sibling_widths(ids).into_iter().next() {
        Some(reason) => Err(ScaffoldError::InvalidId {
            kind: kind.kind(),
            reason,
            source_path: parent_dir.join(LOCKED_SPEC),
        }),
        None => Ok(()),
    }
}

fn read_units(parent_dir: &Path, kind: UnitKind) -> Result<Vec<Unit>> {
    let source_path = parent_dir.join(LOCKED_SPEC);
    let contents = read_artifact(&source_path)?;
    Ok(extract_units(&contents, kind, &source_path)?)
}

/// Extract units of `kind` from a locked spec. Each unit's body runs until the
/// next heading at the same or a shallower level.
pub fn extract_units(
    contents: &str,
    kind: UnitKind,
    source_path: &Path,
) -> Result<Vec<Unit>, ScaffoldError> {
    let mut units = Vec::new();
    let mut seen = BTreeSet::new();

    for (line_end, caps) in headings(contents) {
        if &caps[2] != kind.heading() {
            continue;
        }
        let depth = caps[1].len();
        let id = caps[3].to_string();
        if let Some(reason) = check_id(&id) {
            return Err(ScaffoldError::InvalidId {
                kind: kind.kind(),
                reason,
                source_path: source_path.to_path_buf(),
            });
        }
        if !seen.insert(id.clone()) {
            return Err(ScaffoldError::DuplicateId {
                kind: kind.kind(),
                id,
                source_path: source_path.to_path_buf(),
            });
        }
        let title = caps
            .get(4)
            .map(|m| m.as_str().trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| id.clone());

        let rest = &contents[line_end..];
        let end = section_end(rest, depth);
        units.push(Unit {
            id,
            title,
            body: rest[..end].trim().to_string(),
        });
    }

    if let Some(reason) = check_sibling_widths(units.iter().map(|u| u.id.as_str()))
        .into_iter()
        .next()
    {
        return Err(ScaffoldError::InvalidId {
            kind: kind.kind(),
            reason,
            source_path: source_path.to_path_buf(),
        });
    }
    if units.is_empty() {
        return Err(ScaffoldError::NoUnits {
            kind: kind.kind(),
            heading: kind.heading(),
            source_path: source_path.to_path_buf(),
        });
    }
    debug!(kind = kind.kind(), count = units.len(), "extracted units");
    Ok(units)
}

/// Unit headings outside fenced code blocks, paired with the byte offset just
/// past the heading line.
fn headings(contents: &str) -> Vec<(usize, regex::Captures<'_>)> {
    let mut found = Vec::new();
    let mut offset = 0;
    let mut in_fence = false;
    for line in contents.split_inclusive('\n') {
        offset += line.len();
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(caps) = HEADING_RE.captures(line.trim_end()) {
            found.push((offset, caps));
        }
    }
    found
}

/// Byte offset of the first heading in `rest` at depth <= `depth`.
fn section_end(rest: &str, depth: usize) -> usize {
    let mut offset = 0;
    let mut in_fence = false;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
        } else if !in_fence {
            let hashes = trimmed.bytes().take_while(|b| *b == b'#').count();
            let is_heading = hashes > 0
                && line.starts_with('#')
                && trimmed[hashes..].starts_with([' ', '\t']);
            if is_heading && hashes <= depth {
                return offset;
            }
        }
        offset += line.len();
    }
    rest.len()
}

fn write_child_spec(dir: &Path, unit: &Unit) -> Result<()> {
    let path = dir.join(SPEC);
    if path.exists() {
        debug!(path = %path.display(), "child spec exists, keeping it");
        return Ok(());
    }
    let mut body = format!("# {}\n", unit.title);
    if !unit.body.is_empty() {
        body.push('\n');
        body.push_str(&unit.body);
        body.push('\n');
    }
    write_atomic(&path, &body)
}
