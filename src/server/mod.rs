//! Server module for the keengate proxy.
//!
//! Builds the shared pipeline from the validated configuration, serves it with
//! axum, and runs the cache pruning task next to it until shutdown.
//!
//! # Routes
//!
//! - `GET /health`: liveness check, answered without the origin gate
//! - everything else: the proxy pipeline
//!
//! # Usage
//!
//! ```rust
//! let config = get_config();
//! start_server(config).await?;
//! ```

pub mod shutdown;

use axum::{
    Router,
    extract::{OriginalUri, State},
    http::{HeaderMap, Method},
    routing::get,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use self::shutdown::{ShutdownAwareTask, ShutdownCoordinator};
use crate::authorizer::RequestAuthorizer;
use crate::cache::{self, CacheStore};
use crate::cors::CorsConfig;
use crate::env::AppConfig;
use crate::pipeline::{Pipeline, ProxyRequest, ProxyResponse};
use crate::proxy::Forwarder;
use crate::proxy::client::{UpstreamClientConfig, create_upstream_client};

/// Seconds to wait for background tasks after the server stops
const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

pub type ServerError = Box<dyn std::error::Error + Send + Sync>;

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// State shared by every request handler
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Build the proxy pipeline from configuration and an opened cache store
pub fn build_pipeline(
    config: &AppConfig,
    store: Arc<dyn CacheStore>,
) -> Result<Pipeline, reqwest::Error> {
    let client_config = UpstreamClientConfig::default()
        .with_request_timeout(Duration::from_secs(config.upstream_timeout));
    let client = create_upstream_client(&client_config)?;

    Ok(Pipeline::new(
        CorsConfig::new().allow_origins(&config.allowed_origins),
        RequestAuthorizer::new(config.public_secret.clone(), config.master_secret.clone()),
        store,
        Forwarder::new(client, &config.upstream_url),
    ))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the proxy and block until a shutdown signal arrives
pub async fn start_server(config: AppConfig) -> Result<(), ServerError> {
    let shutdown_coordinator = ShutdownCoordinator::new();

    let store = cache::open_store(&config.cache_db_url, Duration::from_secs(config.cache_ttl)).await?;
    let pipeline = build_pipeline(&config, store.clone())?;
    let app = create_router(AppState {
        pipeline: Arc::new(pipeline),
    });

    let pruner = spawn_cache_pruner(
        store,
        Duration::from_secs(config.cache_prune_interval),
        &shutdown_coordinator,
    );
    shutdown_coordinator.track(pruner).await;

    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let addr = listener.local_addr()?;
    info!("keengate running on http://{}", addr);
    info!(
        "Forwarding to {} for {} allowed origin(s)",
        config.upstream_url,
        config.allowed_origins.len()
    );

    let shutdown_for_server = shutdown_coordinator.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_for_server.wait_for_shutdown_signal().await;
    });

    if let Err(err) = server.await {
        error!("keengate server error: {}", err);
        shutdown_coordinator.initiate_shutdown();
    }

    shutdown_coordinator
        .wait_for_tasks_completion(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS))
        .await;
    info!("keengate shutdown complete");
    Ok(())
}

/// Periodically delete expired cache records until shutdown
pub fn spawn_cache_pruner(
    store: Arc<dyn CacheStore>,
    interval: Duration,
    coordinator: &ShutdownCoordinator,
) -> JoinHandle<()> {
    let mut shutdown_task = ShutdownAwareTask::new(coordinator);

    tokio::spawn(async move {
        info!(
            "Starting cache pruning background service (every {}s)",
            interval.as_secs()
        );
        loop {
            if shutdown_task.wait_or_shutdown(interval).await {
                info!("Cache pruning service shutting down");
                break;
            }

            match store.prune().await {
                Ok(0) => debug!("No expired cache records"),
                Ok(removed) => info!("Pruned {} expired cache record(s)", removed),
                Err(e) => error!("Failed to prune cache: {}", e),
            }
        }
    })
}

///////////////////////////////////////////////////////////////////////////////
//****                        Private Functions                          ****//
///////////////////////////////////////////////////////////////////////////////

async fn health() -> &'static str {
    "OK"
}

async fn proxy(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> ProxyResponse {
    let request = ProxyRequest::new(method, uri.path(), uri.query(), headers);
    state.pipeline.run(request).await
}
