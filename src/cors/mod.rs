//! # Origin Gate Module
//!
//! Browser queries are only served to pages on allow-listed origins. A request
//! without an `Origin` header, or with one not on the list, is refused before
//! its key is even looked at.
//!
//! ## Features
//!
//! - **Allow-list**: exact origin matching
//! - **Header echo**: requested methods and headers are echoed back
//! - **Preflight**: `OPTIONS` is answered directly with `200 OK`
//!
//! ## Usage
//!
//! ```rust
//! use crate::cors::{CorsConfig, OriginDecision, check_origin};
//!
//! let config = CorsConfig::new().allow_origin("https://dashboard.example.com");
//! match check_origin(&config, &method, &headers) {
//!     OriginDecision::Denied => { /* 403 */ }
//!     OriginDecision::Preflight(cors_headers) => { /* 200 OK */ }
//!     OriginDecision::Allowed(cors_headers) => { /* continue */ }
//! }
//! ```

use axum::http::{HeaderMap, HeaderValue, Method, header};
use std::collections::HashSet;
use tracing::debug;

/// Default maximum age for preflight cache in seconds
pub const DEFAULT_MAX_AGE: u64 = 3600;

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Configuration for the origin gate
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Origins allowed to query through the proxy
    pub allowed_origins: HashSet<String>,
    /// Maximum age for preflight cache in seconds
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: HashSet::new(),
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

impl CorsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an allowed origin
    pub fn allow_origin(mut self, origin: &str) -> Self {
        self.allowed_origins.insert(origin.to_string());
        self
    }

    /// Add several allowed origins
    pub fn allow_origins<I, S>(self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        origins
            .into_iter()
            .fold(self, |config, origin| config.allow_origin(origin.as_ref()))
    }

    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.contains(origin)
    }
}

/// Outcome of the origin gate
#[derive(Debug, Clone, PartialEq)]
pub enum OriginDecision {
    /// Missing or unknown origin
    Denied,
    /// Allowed preflight request, answered without going further
    Preflight(HeaderMap),
    /// Allowed request; the headers go on whatever response is produced
    Allowed(HeaderMap),
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Check the request origin and build the CORS response headers
pub fn check_origin(config: &CorsConfig, method: &Method, headers: &HeaderMap) -> OriginDecision {
    let Some(origin) = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
    else {
        debug!("Request has no readable Origin header");
        return OriginDecision::Denied;
    };

    if !config.is_origin_allowed(origin) {
        debug!(origin = %origin, "Origin not in allow-list");
        return OriginDecision::Denied;
    }

    let cors_headers = cors_headers(config, origin, headers);
    if *method == Method::OPTIONS {
        OriginDecision::Preflight(cors_headers)
    } else {
        OriginDecision::Allowed(cors_headers)
    }
}

/// Build the CORS headers for an allowed origin
pub fn cors_headers(config: &CorsConfig, origin: &str, request_headers: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();

    if let Ok(origin_value) = HeaderValue::from_str(origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin_value);
    }

    if let Some(method) = request_headers.get(header::ACCESS_CONTROL_REQUEST_METHOD) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, method.clone());
    }

    if let Some(requested) = request_headers.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }

    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(config.max_age));

    // responses differ per origin, shared caches must key on it
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));

    headers
}
