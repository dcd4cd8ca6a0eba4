//! Resumable milestone → phase → task workflow engine.
//!
//! Every unit of work is planned through a bounded draft → challenge → refine
//! loop between external agent CLIs, with a tiebreaker when they cannot agree.
//! Progress is checkpointed to `.pipeline/state.json` after every step and each
//! agent output is written to disk before it is acted on, so a killed run can
//! be restarted without repeating paid agent calls.
//!
//! - **[`core`]**: Pure logic (transition guard, resume point, invariants,
//!   decision parsing). No I/O.
//! - **[`io`]**: Filesystem, subprocess and git collaborators behind traits.
//! - **[`cycle`]** and **[`walker`]**: orchestration of the two.

pub mod core;
pub mod cycle;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod state;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod walker;
