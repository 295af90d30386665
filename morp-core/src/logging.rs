//! Structured logging setup, grounded on the teacher's own
//! `tracing`/`tracing-subscriber` usage throughout `plane/src/*`
//! (`env-filter` + `fmt`).

use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber driven by `RUST_LOG` (defaulting
/// to `info`). Safe to call more than once; subsequent calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
