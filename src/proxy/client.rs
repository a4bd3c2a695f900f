//! # Upstream HTTP Client Module
//!
//! Builds the HTTP client used for upstream analytics requests, with timeouts
//! and connection pooling settings.
//!
//! ## Usage
//!
//! ```rust
//! use crate::proxy::client::{UpstreamClientConfig, create_upstream_client};
//!
//! let client = create_upstream_client(&UpstreamClientConfig::default())?;
//! ```

use reqwest::{Client, ClientBuilder};
use std::time::Duration;
use tracing::info;

/// Default request timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default connection timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Maximum number of idle connections per host
const MAX_IDLE_CONNECTIONS_PER_HOST: usize = 10;

/// Pool idle timeout in seconds
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

/// User agent string for upstream requests
const USER_AGENT: &str = concat!("keengate/", env!("CARGO_PKG_VERSION"));

/// Configuration for the upstream HTTP client
#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    /// Whole-request timeout, including reading the body
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_idle_connections_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub user_agent: String,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_idle_connections_per_host: MAX_IDLE_CONNECTIONS_PER_HOST,
            pool_idle_timeout: Duration::from_secs(POOL_IDLE_TIMEOUT_SECS),
            user_agent: USER_AGENT.to_string(),
        }
    }
}

impl UpstreamClientConfig {
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        // never wait longer to connect than for the whole request
        self.connect_timeout = self.connect_timeout.min(request_timeout);
        self
    }
}

/// Create the upstream HTTP client
pub fn create_upstream_client(config: &UpstreamClientConfig) -> Result<Client, reqwest::Error> {
    let client = ClientBuilder::new()
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .user_agent(&config.user_agent)
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.max_idle_connections_per_host)
        .build()?;

    info!(
        "Upstream HTTP client created - timeout: {}s, connect_timeout: {}s",
        config.request_timeout.as_secs(),
        config.connect_timeout.as_secs()
    );

    Ok(client)
}
