//! # Request Pipeline Module
//!
//! Every proxied request runs through the same ordered stages:
//!
//! 1. **Origin gate**: unknown origins get a 403, preflights get `200 OK`
//! 2. **Authorize**: validate the scoped key and rewrite the query
//! 3. **Cache lookup**: answer from a fresh cached response when there is one
//! 4. **Forward and store**: ask the upstream, caching a 200 before replying
//!
//! Each stage returns a [`NextAction`]. The driver stops at the first stage
//! that responds. Once the origin gate has passed, its CORS headers are carried
//! on the context and attached to whatever response a later stage produces.
//!
//! The store handle and the upstream forwarder are injected when the pipeline
//! is built, so tests can swap either one.

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::authorizer::{RequestAuthorizer, RewrittenRequest};
use crate::cache::CacheStore;
use crate::cors::{self, CorsConfig, OriginDecision};
use crate::proxy::{Forwarder, JSON_CONTENT_TYPE};

const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Inbound request as seen by the pipeline
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub request_id: String,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
}

impl ProxyRequest {
    pub fn new(method: Method, path: &str, query: Option<&str>, headers: HeaderMap) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            method,
            path: path.to_string(),
            query: query.map(str::to_string),
            headers,
        }
    }
}

/// Which stage produced a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Gate,
    Rejected,
    Cache,
    Upstream,
}

impl fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseSource::Gate => "gate",
            ResponseSource::Rejected => "rejected",
            ResponseSource::Cache => "cache",
            ResponseSource::Upstream => "upstream",
        };
        write!(f, "{}", name)
    }
}

/// Response produced by a pipeline stage
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl ProxyResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>, source: ResponseSource) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            source,
        }
    }

    fn with_content_type(mut self, content_type: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers.insert(header::CONTENT_TYPE, value);
        }
        self
    }

    fn with_headers(mut self, headers: &HeaderMap) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// State handed from one stage to the next
#[derive(Debug)]
pub struct RequestContext {
    pub request: ProxyRequest,
    /// CORS headers for the allowed origin, empty until the gate passes
    pub cors_headers: HeaderMap,
    pub rewritten: Option<RewrittenRequest>,
}

impl RequestContext {
    pub fn new(request: ProxyRequest) -> Self {
        Self {
            request,
            cors_headers: HeaderMap::new(),
            rewritten: None,
        }
    }

    /// Build a response carrying the gate's CORS headers
    fn respond(&self, status: StatusCode, body: impl Into<Bytes>, source: ResponseSource) -> ProxyResponse {
        ProxyResponse::new(status, body, source).with_headers(&self.cors_headers)
    }
}

/// Result of a pipeline stage
#[derive(Debug)]
pub enum NextAction {
    Continue(RequestContext),
    Respond(ProxyResponse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    OriginGate,
    Authorize,
    CacheLookup,
    ForwardAndStore,
}

const STAGES: [Stage; 4] = [
    Stage::OriginGate,
    Stage::Authorize,
    Stage::CacheLookup,
    Stage::ForwardAndStore,
];

/// The proxy request pipeline
pub struct Pipeline {
    cors: CorsConfig,
    authorizer: RequestAuthorizer,
    store: Arc<dyn CacheStore>,
    forwarder: Forwarder,
}

impl Pipeline {
    pub fn new(
        cors: CorsConfig,
        authorizer: RequestAuthorizer,
        store: Arc<dyn CacheStore>,
        forwarder: Forwarder,
    ) -> Self {
        Self {
            cors,
            authorizer,
            store,
            forwarder,
        }
    }

    /// Run a request through every stage until one responds
    pub async fn run(&self, request: ProxyRequest) -> ProxyResponse {
        info!(
            request_id = %request.request_id,
            method = %request.method,
            path = %request.path,
            "Incoming request"
        );

        let request_id = request.request_id.clone();
        let mut context = RequestContext::new(request);

        for stage in STAGES {
            context = match self.run_stage(stage, context).await {
                NextAction::Continue(context) => context,
                NextAction::Respond(response) => {
                    info!(
                        request_id = %request_id,
                        status = response.status.as_u16(),
                        source = %response.source,
                        "Request completed"
                    );
                    return response;
                }
            };
        }

        // the forwarding stage always responds
        warn!(request_id = %request_id, "Pipeline finished without a response");
        context.respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            Bytes::new(),
            ResponseSource::Upstream,
        )
    }

    async fn run_stage(&self, stage: Stage, context: RequestContext) -> NextAction {
        match stage {
            Stage::OriginGate => self.origin_gate(context),
            Stage::Authorize => self.authorize(context),
            Stage::CacheLookup => self.cache_lookup(context).await,
            Stage::ForwardAndStore => self.forward_and_store(context).await,
        }
    }

    fn origin_gate(&self, mut context: RequestContext) -> NextAction {
        let request = &context.request;
        match cors::check_origin(&self.cors, &request.method, &request.headers) {
            OriginDecision::Denied => {
                warn!(
                    request_id = %request.request_id,
                    origin = ?request.headers.get(header::ORIGIN),
                    "Origin rejected"
                );
                NextAction::Respond(ProxyResponse::new(
                    StatusCode::FORBIDDEN,
                    Bytes::new(),
                    ResponseSource::Gate,
                ))
            }
            OriginDecision::Preflight(cors_headers) => {
                context.cors_headers = cors_headers;
                NextAction::Respond(
                    context
                        .respond(StatusCode::OK, "OK", ResponseSource::Gate)
                        .with_content_type(TEXT_CONTENT_TYPE),
                )
            }
            OriginDecision::Allowed(cors_headers) => {
                context.cors_headers = cors_headers;
                if context.request.method != Method::GET {
                    warn!(
                        request_id = %context.request.request_id,
                        method = %context.request.method,
                        "Method not allowed"
                    );
                    let mut response = context
                        .respond(
                            StatusCode::METHOD_NOT_ALLOWED,
                            "Method Not Allowed",
                            ResponseSource::Gate,
                        )
                        .with_content_type(TEXT_CONTENT_TYPE);
                    response
                        .headers
                        .insert(header::ALLOW, HeaderValue::from_static("GET, OPTIONS"));
                    return NextAction::Respond(response);
                }
                NextAction::Continue(context)
            }
        }
    }

    fn authorize(&self, mut context: RequestContext) -> NextAction {
        let request = &context.request;
        match self
            .authorizer
            .authorize(&request.path, request.query.as_deref())
        {
            Ok(rewritten) => {
                debug!(
                    request_id = %request.request_id,
                    path = %rewritten.path,
                    "Request authorized"
                );
                context.rewritten = Some(rewritten);
                NextAction::Continue(context)
            }
            Err(rejection) => {
                warn!(
                    request_id = %request.request_id,
                    path = %request.path,
                    reason = %rejection,
                    "Request rejected"
                );
                NextAction::Respond(context.respond(
                    StatusCode::FORBIDDEN,
                    Bytes::new(),
                    ResponseSource::Rejected,
                ))
            }
        }
    }

    async fn cache_lookup(&self, context: RequestContext) -> NextAction {
        let Some(rewritten) = context.rewritten.as_ref() else {
            return NextAction::Continue(context);
        };
        let cache_key = rewritten.cache_key();

        match self.store.lookup(&cache_key).await {
            Ok(Some(entry)) => {
                info!(
                    request_id = %context.request.request_id,
                    cache_key = %entry.key,
                    cached_at = %entry.cached_at,
                    "Cache hit"
                );
                NextAction::Respond(
                    context
                        .respond(StatusCode::OK, entry.response_body, ResponseSource::Cache)
                        .with_content_type(JSON_CONTENT_TYPE),
                )
            }
            Ok(None) => {
                debug!(
                    request_id = %context.request.request_id,
                    cache_key = %cache_key,
                    "Cache miss"
                );
                NextAction::Continue(context)
            }
            Err(err) => {
                warn!(
                    request_id = %context.request.request_id,
                    cache_key = %cache_key,
                    error = %err,
                    "Cache lookup failed, treating as miss"
                );
                NextAction::Continue(context)
            }
        }
    }

    async fn forward_and_store(&self, context: RequestContext) -> NextAction {
        let Some(rewritten) = context.rewritten.as_ref() else {
            return NextAction::Continue(context);
        };

        let upstream = self.forwarder.forward(rewritten).await;

        if upstream.is_cacheable() {
            let cache_key = rewritten.cache_key();
            match self.store.store(&cache_key, &upstream.body).await {
                Ok(()) => debug!(
                    request_id = %context.request.request_id,
                    cache_key = %cache_key,
                    "Cached upstream response"
                ),
                Err(err) => warn!(
                    request_id = %context.request.request_id,
                    cache_key = %cache_key,
                    error = %err,
                    "Failed to cache upstream response"
                ),
            }
        }

        let mut response = context.respond(upstream.status, upstream.body, ResponseSource::Upstream);
        if let Some(content_type) = upstream.content_type.as_deref() {
            response = response.with_content_type(content_type);
        }
        NextAction::Respond(response)
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
