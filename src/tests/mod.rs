//! End-to-end tests: the proxy router served on a local port in front of a
//! fake upstream, driven over HTTP with reqwest.

use reqwest::{Client, Response, StatusCode, header};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::authorizer::RequestAuthorizer;
use crate::cache::{CacheStore, MemoryCacheStore};
use crate::cors::CorsConfig;
use crate::filters::{self, Filter};
use crate::pipeline::Pipeline;
use crate::proxy::Forwarder;
use crate::test_server::{FakeUpstream, spawn_fake_upstream, spawn_proxy, unused_local_addr};
use crate::token::{self, ScopedTokenParams, TokenSecret};

const PUBLIC: &str = "0123456789abcdef0123456789abcdef";
const MASTER: &str = "masterkeymasterkeymasterkeymaste";
const ORIGIN: &str = "https://dashboard.example.com";
const COUNT_PATH: &str = "/3.0/projects/PROJECT/queries/count";

struct Harness {
    proxy: SocketAddr,
    upstream: FakeUpstream,
    store: Arc<MemoryCacheStore>,
    client: Client,
    _shutdown: Vec<oneshot::Sender<()>>,
}

impl Harness {
    async fn start() -> Self {
        let (upstream_addr, upstream, upstream_shutdown) = spawn_fake_upstream().await;
        let mut harness = Self::with_upstream(&format!("http://{}", upstream_addr), upstream).await;
        harness._shutdown.push(upstream_shutdown);
        harness
    }

    async fn with_upstream(upstream_url: &str, upstream: FakeUpstream) -> Self {
        let store = Arc::new(MemoryCacheStore::new(Duration::from_secs(600)));
        let shared: Arc<dyn CacheStore> = store.clone();
        let pipeline = Pipeline::new(
            CorsConfig::new().allow_origin(ORIGIN),
            RequestAuthorizer::new(
                TokenSecret::new(PUBLIC).unwrap(),
                TokenSecret::new(MASTER).unwrap(),
            ),
            shared,
            Forwarder::new(Client::new(), upstream_url),
        );
        let (proxy, proxy_shutdown) = spawn_proxy(pipeline).await;

        Self {
            proxy,
            upstream,
            store,
            client: Client::new(),
            _shutdown: vec![proxy_shutdown],
        }
    }

    fn url(&self, path: &str, pairs: &[(&str, &str)]) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter())
            .finish();
        format!("http://{}{}?{}", self.proxy, path, query)
    }

    async fn get(&self, path: &str, pairs: &[(&str, &str)]) -> Response {
        self.client
            .get(self.url(path, pairs))
            .header(header::ORIGIN, ORIGIN)
            .send()
            .await
            .unwrap()
    }
}

fn public_key(params: &ScopedTokenParams) -> String {
    token::encode(&TokenSecret::new(PUBLIC).unwrap(), params).unwrap()
}

fn read_key() -> String {
    public_key(&ScopedTokenParams::new(["read"]))
}

fn upstream_filters(upstream: &FakeUpstream) -> Vec<Filter> {
    let request = upstream.last_request().unwrap();
    filters::parse_filters(request.param("filters").unwrap()).unwrap()
}

#[tokio::test]
async fn missing_or_unknown_origin_is_refused() {
    let harness = Harness::start().await;
    let url = harness.url(COUNT_PATH, &[("api_key", read_key().as_str())]);

    let response = harness.client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(response.text().await.unwrap().is_empty());

    let response = harness
        .client
        .get(&url)
        .header(header::ORIGIN, "https://evil.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());

    assert_eq!(harness.upstream.request_count(), 0);
}

#[tokio::test]
async fn preflight_is_answered_without_a_key() {
    let harness = Harness::start().await;

    let response = harness
        .client
        .request(reqwest::Method::OPTIONS, harness.url(COUNT_PATH, &[]))
        .header(header::ORIGIN, ORIGIN)
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), ORIGIN);
    assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(), "GET");
    assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(), "content-type");
    assert_eq!(headers.get(header::ACCESS_CONTROL_MAX_AGE).unwrap(), "3600");
    assert_eq!(response.text().await.unwrap(), "OK");
    assert_eq!(harness.upstream.request_count(), 0);
}

#[tokio::test]
async fn valid_key_is_forwarded_with_master_key() {
    let harness = Harness::start().await;
    let params = ScopedTokenParams::new(["read"]);
    let key = public_key(&params);

    let response = harness
        .get(COUNT_PATH, &[("api_key", key.as_str()), ("event_collection", "pageviews")])
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        ORIGIN
    );
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"result": 42}));

    let seen = harness.upstream.last_request().unwrap();
    assert_eq!(seen.path, COUNT_PATH);
    assert_eq!(seen.param("event_collection"), Some("pageviews"));
    let upstream_key = seen.param("api_key").unwrap();
    assert_ne!(upstream_key, key);
    assert_eq!(
        token::decode(&TokenSecret::new(MASTER).unwrap(), upstream_key).unwrap(),
        params
    );
}

#[tokio::test]
async fn bad_keys_are_refused_before_upstream() {
    let harness = Harness::start().await;
    let foreign = token::encode(
        &TokenSecret::new("fedcba9876543210fedcba9876543210").unwrap(),
        &ScopedTokenParams::new(["read"]),
    )
    .unwrap();

    for pairs in [
        vec![("timeframe", "this_week")],
        vec![("api_key", "BUTTS")],
        vec![("api_key", foreign.as_str())],
    ] {
        let response = harness.get(COUNT_PATH, &pairs).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        // rejections after the gate still carry CORS headers
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            ORIGIN
        );
    }

    assert_eq!(harness.upstream.request_count(), 0);
}

#[tokio::test]
async fn key_filters_replace_widened_request_filters() {
    let harness = Harness::start().await;
    let key = public_key(
        &ScopedTokenParams::new(["read"]).with_filters(vec![Filter::eq("app", json!("web"))]),
    );
    let requested = filters::to_query_value(&[
        Filter::eq("app", json!("admin")),
        Filter::eq("user", json!(7)),
    ]);

    let response = harness
        .get(COUNT_PATH, &[("api_key", key.as_str()), ("filters", requested.as_str())])
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        upstream_filters(&harness.upstream),
        vec![Filter::eq("app", json!("web"))]
    );
}

#[tokio::test]
async fn narrower_request_filters_are_kept() {
    let harness = Harness::start().await;
    let key = public_key(
        &ScopedTokenParams::new(["read"])
            .with_filters(vec![Filter::is_in("app", vec![json!("web"), json!("ios")])]),
    );
    let requested = filters::to_query_value(&[Filter::eq("app", json!("ios"))]);

    harness
        .get(COUNT_PATH, &[("api_key", key.as_str()), ("filters", requested.as_str())])
        .await;

    assert_eq!(
        upstream_filters(&harness.upstream),
        vec![Filter::eq("app", json!("ios"))]
    );
}

#[tokio::test]
async fn unparseable_filters_are_refused_when_key_has_filters() {
    let harness = Harness::start().await;
    let key = public_key(
        &ScopedTokenParams::new(["read"]).with_filters(vec![Filter::eq("app", json!("web"))]),
    );

    let response = harness
        .get(COUNT_PATH, &[("api_key", key.as_str()), ("filters", "[{broken")])
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(harness.upstream.request_count(), 0);
}

#[tokio::test]
async fn analysis_type_restricts_the_query_path() {
    let harness = Harness::start().await;
    let key = public_key(&ScopedTokenParams::new(["read"]).with_analysis_type("count"));

    let response = harness.get(COUNT_PATH, &[("api_key", key.as_str())]).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = harness
        .get("/3.0/projects/PROJECT/queries/sum", &[("api_key", key.as_str())])
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    assert_eq!(harness.upstream.request_count(), 1);
}

#[tokio::test]
async fn key_parameters_override_request_parameters() {
    let harness = Harness::start().await;
    let key = public_key(
        &ScopedTokenParams::new(["read"])
            .with_param("event_collection", json!("pageviews"))
            .unwrap(),
    );

    harness
        .get(
            COUNT_PATH,
            &[("api_key", key.as_str()), ("event_collection", "purchases"), ("timeframe", "this_week")],
        )
        .await;

    let seen = harness.upstream.last_request().unwrap();
    assert_eq!(seen.param("event_collection"), Some("pageviews"));
    assert_eq!(seen.param("timeframe"), Some("this_week"));
}

#[tokio::test]
async fn repeated_query_is_served_from_cache() {
    let harness = Harness::start().await;
    let params = ScopedTokenParams::new(["read"]);
    let pairs_for = |key: &str| {
        vec![
            ("api_key".to_string(), key.to_string()),
            ("timeframe".to_string(), "this_week".to_string()),
        ]
    };

    let first_key = public_key(&params);
    let first_pairs = pairs_for(&first_key);
    let first: Vec<(&str, &str)> = first_pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let response = harness.get(COUNT_PATH, &first).await;
    assert_eq!(response.status(), StatusCode::OK);
    let first_body = response.text().await.unwrap();

    // the upstream answer changes, but the cached one is still fresh
    harness
        .upstream
        .set_response(StatusCode::OK, r#"{"result":0}"#);

    // an identical key encrypted with another IV is the same query
    let second_key = public_key(&params);
    assert_ne!(first_key, second_key);
    let second_pairs = pairs_for(&second_key);
    let second: Vec<(&str, &str)> =
        second_pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let response = harness.get(COUNT_PATH, &second).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        ORIGIN
    );
    assert_eq!(response.text().await.unwrap(), first_body);
    assert_eq!(harness.upstream.request_count(), 1);
}

#[tokio::test]
async fn different_queries_do_not_share_cache_entries() {
    let harness = Harness::start().await;
    let key = read_key();

    harness
        .get(COUNT_PATH, &[("api_key", key.as_str()), ("timeframe", "this_week")])
        .await;
    harness
        .get(COUNT_PATH, &[("api_key", key.as_str()), ("timeframe", "this_month")])
        .await;

    assert_eq!(harness.upstream.request_count(), 2);
}

#[tokio::test]
async fn unsuccessful_responses_are_not_cached() {
    let harness = Harness::start().await;
    let key = read_key();

    for status in [500u16, 404] {
        harness.upstream.set_response(
            StatusCode::from_u16(status).unwrap(),
            r#"{"message":"no"}"#,
        );
        let before = harness.upstream.request_count();

        for _ in 0..2 {
            let response = harness.get(COUNT_PATH, &[("api_key", key.as_str())]).await;
            assert_eq!(response.status().as_u16(), status);
            assert_eq!(response.text().await.unwrap(), r#"{"message":"no"}"#);
        }

        assert_eq!(harness.upstream.request_count(), before + 2);
    }

    let cache_key = format!("{}?allowed_operations=read", COUNT_PATH);
    assert_eq!(harness.store.entry_count(&cache_key).await, 0);
}

#[tokio::test]
async fn unreachable_upstream_yields_500_with_error_body() {
    let (_, idle_upstream, _upstream_shutdown) = spawn_fake_upstream().await;
    let dead = unused_local_addr().await;
    let harness = Harness::with_upstream(&format!("http://{}", dead), idle_upstream).await;

    let response = harness.get(COUNT_PATH, &[("api_key", read_key().as_str())]).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));
}

#[tokio::test]
async fn other_methods_are_not_allowed() {
    let harness = Harness::start().await;

    let response = harness
        .client
        .post(harness.url(COUNT_PATH, &[("api_key", read_key().as_str())]))
        .header(header::ORIGIN, ORIGIN)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(harness.upstream.request_count(), 0);
}

#[tokio::test]
async fn health_check_skips_the_origin_gate() {
    let harness = Harness::start().await;

    let response = harness
        .client
        .get(format!("http://{}/health", harness.proxy))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "OK");
}
