//! Logging initialization helpers.
//!
//! The library itself only emits `tracing` events and never installs a
//! global subscriber; binaries and tests that want output call one of these
//! once at startup.

use tracing_subscriber::EnvFilter;

/// Initialize compact log output at `info` unless `RUST_LOG` says otherwise.
pub fn init() {
    init_with_filter("info");
}

/// Initialize compact log output with an explicit default filter.
///
/// `RUST_LOG` still takes precedence. Safe to call more than once; later
/// calls are no-ops.
pub fn init_with_filter(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Initialize JSON log output, for deployments that ship logs structured.
pub fn init_json() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init();
}
