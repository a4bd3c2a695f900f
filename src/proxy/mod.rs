//! # Proxy Forwarder Module
//!
//! Sends an authorized, rewritten query to the upstream analytics service and
//! buffers the whole response.
//!
//! Responses are held in memory in full before being returned or cached. That
//! is fine for analytics results, which are small; large payloads would need a
//! streaming path that this proxy does not have.
//!
//! A transport failure (connection refused, timeout, broken body) becomes a
//! `500` carrying `{"error": "..."}` so the caller always gets a response.

pub mod client;

use axum::body::Bytes;
use axum::http::StatusCode;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, error};

use crate::authorizer::RewrittenRequest;

pub const JSON_CONTENT_TYPE: &str = "application/json";

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Fully buffered upstream response
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: Option<String>,
}

impl UpstreamResponse {
    fn transport_error(err: &reqwest::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: Bytes::from(json!({ "error": err.to_string() }).to_string()),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
        }
    }

    /// Only complete, successful responses may be cached
    pub fn is_cacheable(&self) -> bool {
        self.status == StatusCode::OK
    }
}

/// Issues rewritten requests against the upstream base URL
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: Client,
    base_url: String,
}

impl Forwarder {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn upstream_url(&self, request: &RewrittenRequest) -> String {
        format!("{}{}", self.base_url, request.path_and_query())
    }

    /// Forward the request; never fails, transport errors become a 500
    pub async fn forward(&self, request: &RewrittenRequest) -> UpstreamResponse {
        // the full URL carries the master-encrypted key, so only the path is logged
        debug!(upstream = %self.base_url, path = %request.path, "Sending upstream request");

        match self.fetch(&self.upstream_url(request)).await {
            Ok(response) => {
                debug!(
                    path = %request.path,
                    status = %response.status,
                    response_size_bytes = response.body.len(),
                    "Upstream responded"
                );
                response
            }
            Err(err) => {
                error!(
                    upstream = %self.base_url,
                    path = %request.path,
                    error = %err,
                    "Upstream request failed"
                );
                UpstreamResponse::transport_error(&err)
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<UpstreamResponse, reqwest::Error> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;

        Ok(UpstreamResponse {
            status,
            body,
            content_type,
        })
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
