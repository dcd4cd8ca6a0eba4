//! Stable exit codes for pipeline CLI commands.

/// Command succeeded; `run` finished every milestone.
pub const OK: i32 = 0;
/// Invalid state/config, agent failure or any other error.
pub const FAILED: i32 = 1;
/// `run` stopped at a phase review gate.
pub const REVIEW_GATE: i32 = 2;
/// `status` found nothing left to do.
pub const COMPLETE: i32 = 2;
