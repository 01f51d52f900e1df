//! Tracing subscriber setup. Installed once by the agent; every other
//! crate only emits.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber with an env-filter. `RUST_LOG`
/// overrides `default_filter`. Safe to call more than once; later calls
/// are no-ops.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
