//! Development-time tracing.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of fixloop's product output.
//!
//! - **Iteration logging (`io/iteration_log`)**: Product artifacts in
//!   `.fixloop/iterations/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the stderr subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directive` applies (`warn` for quick
/// commands, `info` during a run, `debug` with `--debug`).
///
/// # Example
/// ```bash
/// RUST_LOG=fixloop=debug fixloop run --repo . --branch fixloop/work
/// ```
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
