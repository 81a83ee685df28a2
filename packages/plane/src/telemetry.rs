//! Tracing subscriber wiring for binaries and tests. Library crates only
//! emit events; installing the subscriber is the embedder's call.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a global fmt subscriber honouring `RUST_LOG`, defaulting to
/// `info`. Safe to call more than once; later calls are no-ops.
pub fn init_telemetry() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
