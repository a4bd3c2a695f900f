//! Local servers used by the test suite: a fake upstream analytics API that
//! records what it receives, and a helper serving the proxy router itself.

use axum::{
    Router,
    extract::{OriginalUri, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use url::form_urlencoded;

use crate::pipeline::Pipeline;
use crate::server::{AppState, create_router};

/// A request as received by the fake upstream
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug)]
struct FakeUpstreamState {
    status: StatusCode,
    body: String,
    requests: Vec<RecordedRequest>,
}

/// Handle on a running fake upstream
#[derive(Debug, Clone)]
pub struct FakeUpstream {
    state: Arc<Mutex<FakeUpstreamState>>,
}

impl FakeUpstream {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeUpstreamState {
                status: StatusCode::OK,
                body: r#"{"result":42}"#.to_string(),
                requests: Vec::new(),
            })),
        }
    }

    /// Set the response returned for every following request
    pub fn set_response(&self, status: StatusCode, body: &str) {
        let mut state = self.state.lock().unwrap();
        state.status = status;
        state.body = body.to_string();
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state.lock().unwrap().requests.last().cloned()
    }
}

async fn record(State(upstream): State<FakeUpstream>, OriginalUri(uri): OriginalUri) -> impl IntoResponse {
    let mut state = upstream.state.lock().unwrap();
    state.requests.push(RecordedRequest {
        path: uri.path().to_string(),
        query: uri
            .query()
            .map(|query| form_urlencoded::parse(query.as_bytes()).into_owned().collect())
            .unwrap_or_default(),
    });
    (
        state.status,
        [(header::CONTENT_TYPE, "application/json")],
        state.body.clone(),
    )
}

/// Serve `app` on an ephemeral local port until the sender fires
async fn serve(app: Router) -> (SocketAddr, oneshot::Sender<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                rx.await.ok();
            })
            .await
            .unwrap();
    });
    (addr, tx)
}

pub async fn spawn_fake_upstream() -> (SocketAddr, FakeUpstream, oneshot::Sender<()>) {
    let upstream = FakeUpstream::new();
    let app = Router::new().fallback(record).with_state(upstream.clone());
    let (addr, tx) = serve(app).await;
    (addr, upstream, tx)
}

pub async fn spawn_proxy(pipeline: Pipeline) -> (SocketAddr, oneshot::Sender<()>) {
    let state = AppState {
        pipeline: Arc::new(pipeline),
    };
    serve(create_router(state)).await
}

/// A local address with nothing listening on it
pub async fn unused_local_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
