#![forbid(unsafe_code)]

//! Subscriber setup for binaries and tests.
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! application's call. Both helpers are idempotent: a second call (or a
//! subscriber installed elsewhere) is left alone.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install a global `fmt` subscriber per `config`. Returns `false` if one
/// was already installed.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    if installed {
        tracing::debug!(filter = %config.filter, json = config.json, "logging initialized");
    }
    installed
}

/// Subscriber that writes through the test harness's captured output.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("debug"))
        .try_init();
}
