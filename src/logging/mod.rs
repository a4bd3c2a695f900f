//! # Logging Module
//!
//! Sets up the `tracing` subscriber for the proxy. The filter comes from
//! `KEENGATE_LOG_LEVEL`, then `RUST_LOG`, then the built-in default, and uses
//! the usual `EnvFilter` directive syntax (`keengate=debug,tower_http=info`).

use tracing_subscriber::EnvFilter;

use crate::env::DEFAULT_LOG_LEVEL;

/// Build the filter for `log_level`, falling back to the default on bad input
pub fn build_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level).unwrap_or_else(|e| {
        eprintln!(
            "Invalid log filter '{}': {}. Using '{}'",
            log_level, e, DEFAULT_LOG_LEVEL
        );
        EnvFilter::new(DEFAULT_LOG_LEVEL)
    })
}

/// Install the global subscriber; later calls are ignored
pub fn init_tracing(log_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(log_level))
        .with_target(true)
        .try_init();
}

/// Log filter from the environment without running full validation
pub fn log_level_from_env() -> String {
    std::env::var("KEENGATE_LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
}
