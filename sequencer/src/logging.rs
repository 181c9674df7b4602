//! Diagnostic tracing for the sequencer.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG`. It is separate from
//! product output (plans, scripts, job ids, step summaries on stdout) and
//! from the run records under `.sequencer/runs/`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn` if unset.
///
/// # Example
/// ```bash
/// RUST_LOG=sequencer=debug sequencer run
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
