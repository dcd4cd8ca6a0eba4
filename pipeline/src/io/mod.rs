//! Side-effecting collaborators: filesystem, subprocesses, git.

pub mod agent;
pub mod artifact;
pub mod config;
pub mod git;
pub mod init;
pub mod process;
pub mod scaffold;
pub mod state_store;
pub mod templates;
