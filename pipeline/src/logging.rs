//! Diagnostic tracing for the pipeline.
//!
//! Tracing output goes to stderr and is controlled by `RUST_LOG`. It is not
//! product output: drafts, feedback, locked artifacts and the per-call agent
//! logs under `.pipeline/logs/` are written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset: progress from this crate, warnings from dependencies.
pub const DEFAULT_FILTER: &str = "pipeline=info,warn";

/// Initialize the tracing subscriber.
///
/// # Example
/// ```bash
/// RUST_LOG=pipeline=debug pipeline run
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
