//! Tracing subscriber setup for the station binary.

use tracing_subscriber::{filter::EnvFilter, fmt};

/// Install the global subscriber. Honours `RUST_LOG`, defaulting to `info`.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_timer(fmt::time::uptime())
        .try_init();
}
