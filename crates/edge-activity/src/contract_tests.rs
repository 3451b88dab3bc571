use crate::proxy::{ActivityProxy, CachePolicy};
use crate::{build_router, AppState};
use axum::body::{to_bytes, Body};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use edge_core::edge_cache::{EdgeCache, MemoryEdgeCache};
use edge_core::envelope::JSON_CONTENT_TYPE;
use reqwest::Url;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceExt;

const ORIGIN: &str = "https://blog.example";
const CONTRIBUTIONS: &str = r#"{"total": {"2019": 5}, "contributions": [{"date": "2019-01-01", "count": 5, "level": 2}]}"#;

#[derive(Default)]
struct UpstreamLog {
    calls: AtomicUsize,
    uris: Mutex<Vec<String>>,
}

impl UpstreamLog {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn uris(&self) -> Vec<String> {
        self.uris.lock().expect("uri log").clone()
    }
}

async fn mock_contributions(
    State(log): State<Arc<UpstreamLog>>,
    Path(user): Path<String>,
    uri: Uri,
) -> Response {
    log.calls.fetch_add(1, Ordering::SeqCst);
    log.uris.lock().expect("uri log").push(uri.to_string());
    match user.as_str() {
        "broken" => (StatusCode::OK, "<html>rate limited</html>").into_response(),
        "ghost" => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "User not found" })),
        )
            .into_response(),
        "teapot" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "message": "boom" })),
        )
            .into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(3)).await;
            (StatusCode::OK, CONTRIBUTIONS).into_response()
        }
        _ => (
            StatusCode::OK,
            [("content-type", "application/json")],
            CONTRIBUTIONS,
        )
            .into_response(),
    }
}

async fn spawn_upstream() -> (Url, Arc<UpstreamLog>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    let log = Arc::new(UpstreamLog::default());
    let app = Router::new()
        .route("/v4/:user", get(mock_contributions))
        .with_state(Arc::clone(&log));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("upstream server");
    });
    let base = Url::parse(&format!("http://{addr}/v4/")).expect("base url");
    (base, log)
}

async fn closed_port_base() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    Url::parse(&format!("http://{addr}/v4/")).expect("base url")
}

fn proxy_state(base: Url, policy: CachePolicy) -> (AppState, Arc<MemoryEdgeCache>) {
    let cache = Arc::new(MemoryEdgeCache::new(16));
    let proxy = ActivityProxy::new(
        base,
        Duration::from_millis(500),
        Arc::clone(&cache) as Arc<dyn EdgeCache>,
        policy,
    )
    .expect("proxy");
    (AppState::new(Arc::new(proxy)), cache)
}

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let response = build_router(state.clone())
        .oneshot(request)
        .await
        .expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body");
    (status, headers, body.to_vec())
}

fn get_request(uri: &str, origin: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("origin", origin)
        .body(Body::empty())
        .expect("request")
}

fn error_code(body: &[u8]) -> String {
    let payload: Value = serde_json::from_slice(body).expect("json body");
    payload["error"].as_str().expect("error code").to_string()
}

#[tokio::test]
async fn miss_fetches_upstream_and_relays_body_verbatim() {
    let (base, log) = spawn_upstream().await;
    let (state, cache) = proxy_state(base, CachePolicy::default());

    let (status, headers, body) =
        send(&state, get_request("/github-activity?u=octocat&y=2019", ORIGIN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, CONTRIBUTIONS.as_bytes());
    assert_eq!(headers.get("content-type").unwrap(), JSON_CONTENT_TYPE);
    assert_eq!(
        headers.get("cache-control").unwrap(),
        "public, max-age=60, s-maxage=21600, stale-while-revalidate=86400"
    );
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), ORIGIN);
    assert_eq!(headers.get("access-control-allow-methods").unwrap(), "GET,OPTIONS");
    assert_eq!(log.calls(), 1);
    assert_eq!(log.uris(), vec!["/v4/octocat?y=2019".to_string()]);
    assert_eq!(cache.len().await, 1);
}

#[tokio::test]
async fn repeated_request_is_served_from_cache_with_fresh_cors() {
    let (base, log) = spawn_upstream().await;
    let (state, _cache) = proxy_state(base, CachePolicy::default());

    let (first_status, _, first_body) =
        send(&state, get_request("/github-activity?u=octocat", ORIGIN)).await;
    let (second_status, headers, second_body) = send(
        &state,
        get_request("/github-activity?u=octocat", "https://mirror.example"),
    )
    .await;

    assert_eq!(first_status, StatusCode::OK);
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(first_body, second_body);
    assert_eq!(log.calls(), 1);
    assert_eq!(
        headers.get("access-control-allow-origin").unwrap(),
        "https://mirror.example"
    );
    assert!(headers.get("cache-control").is_some());
}

#[tokio::test]
async fn equivalent_years_share_one_cache_entry() {
    let (base, log) = spawn_upstream().await;
    let (state, _cache) = proxy_state(base, CachePolicy::default());

    for uri in [
        "/github-activity?u=octocat",
        "/github-activity?u=octocat&y=",
        "/github-activity?u=octocat&y=last",
        "/github-activity?u=octocat&y=2007",
        "/github-activity?u=octocat&y=2101",
        "/github-activity?u=octocat&y=soon",
        "/github-activity?u=%20octocat%20&y=last",
    ] {
        let (status, _, _) = send(&state, get_request(uri, ORIGIN)).await;
        assert_eq!(status, StatusCode::OK, "uri: {uri}");
    }
    assert_eq!(log.calls(), 1);
    assert_eq!(log.uris(), vec!["/v4/octocat?y=last".to_string()]);

    send(&state, get_request("/github-activity?u=octocat&y=2008", ORIGIN)).await;
    send(&state, get_request("/github-activity?u=octocat&y=2100.7", ORIGIN)).await;
    assert_eq!(log.calls(), 3);
    assert_eq!(
        log.uris()[1..],
        ["/v4/octocat?y=2008".to_string(), "/v4/octocat?y=2100".to_string()]
    );
}

#[tokio::test]
async fn expired_entry_is_refetched() {
    let (base, log) = spawn_upstream().await;
    let policy = CachePolicy {
        shared_max_age: Duration::from_millis(200),
        ..CachePolicy::default()
    };
    let (state, _cache) = proxy_state(base, policy);

    send(&state, get_request("/github-activity?u=octocat", ORIGIN)).await;
    send(&state, get_request("/github-activity?u=octocat", ORIGIN)).await;
    assert_eq!(log.calls(), 1);

    tokio::time::sleep(Duration::from_millis(350)).await;
    let (status, _, _) = send(&state, get_request("/github-activity?u=octocat", ORIGIN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(log.calls(), 2);
}

#[tokio::test]
async fn repeated_query_keys_use_first_value() {
    let (base, log) = spawn_upstream().await;
    let (state, _cache) = proxy_state(base, CachePolicy::default());

    let (status, _, body) = send(
        &state,
        get_request("/github-activity?u=octocat&u=hubot&y=2019&y=2020", ORIGIN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, CONTRIBUTIONS.as_bytes());
    assert_eq!(log.uris(), vec!["/v4/octocat?y=2019".to_string()]);
}

#[tokio::test]
async fn username_is_escaped_as_single_path_segment() {
    let (base, log) = spawn_upstream().await;
    let (state, _cache) = proxy_state(base, CachePolicy::default());

    let (status, _, _) =
        send(&state, get_request("/github-activity?u=a%20b%2Fc", ORIGIN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(log.uris(), vec!["/v4/a%20b%2Fc?y=last".to_string()]);
}

#[tokio::test]
async fn missing_or_oversized_user_is_rejected_without_upstream_call() {
    let (base, log) = spawn_upstream().await;
    let (state, _cache) = proxy_state(base, CachePolicy::default());

    for uri in ["/github-activity", "/github-activity?u=", "/github-activity?u=%20%20"] {
        let (status, headers, body) = send(&state, get_request(uri, ORIGIN)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "uri: {uri}");
        assert_eq!(error_code(&body), "missing_user");
        assert_eq!(headers.get("access-control-allow-origin").unwrap(), ORIGIN);
    }

    let long_user = "a".repeat(65);
    let (status, _, body) = send(
        &state,
        get_request(&format!("/github-activity?u={long_user}"), ORIGIN),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "bad_user");

    for uri in ["/github-activity?u=.", "/github-activity?u=..", "/github-activity?u=%2E%2E"] {
        let (status, _, body) = send(&state, get_request(uri, ORIGIN)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "uri: {uri}");
        assert_eq!(error_code(&body), "bad_user");
    }

    let exact_user = "a".repeat(64);
    let (status, _, _) = send(
        &state,
        get_request(&format!("/github-activity?u={exact_user}"), ORIGIN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(log.calls(), 1);
}

#[tokio::test]
async fn non_json_upstream_body_is_bad_gateway() {
    let (base, log) = spawn_upstream().await;
    let (state, cache) = proxy_state(base, CachePolicy::default());

    let (status, _, body) = send(&state, get_request("/github-activity?u=broken", ORIGIN)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(&body), "bad_upstream_json");
    assert!(cache.is_empty().await);

    send(&state, get_request("/github-activity?u=broken", ORIGIN)).await;
    assert_eq!(log.calls(), 2);
}

#[tokio::test]
async fn upstream_failure_relays_its_error_message() {
    let (base, _log) = spawn_upstream().await;
    let (state, cache) = proxy_state(base, CachePolicy::default());

    let (status, _, body) = send(&state, get_request("/github-activity?u=ghost", ORIGIN)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(&body), "User not found");

    let (status, _, body) = send(&state, get_request("/github-activity?u=teapot", ORIGIN)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(&body), "upstream_failed");
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn slow_upstream_times_out() {
    let (base, _log) = spawn_upstream().await;
    let (state, cache) = proxy_state(base, CachePolicy::default());

    let (status, headers, body) =
        send(&state, get_request("/github-activity?u=slow", ORIGIN)).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(error_code(&body), "upstream_timeout");
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), ORIGIN);
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn unreachable_upstream_is_gateway_timeout() {
    let (state, cache) = proxy_state(closed_port_base().await, CachePolicy::default());

    let (status, _, body) = send(&state, get_request("/github-activity?u=octocat", ORIGIN)).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(error_code(&body), "upstream_timeout");
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn preflight_and_method_and_path_errors() {
    let (base, log) = spawn_upstream().await;
    let (state, _cache) = proxy_state(base, CachePolicy::default());

    let preflight = Request::builder()
        .method("OPTIONS")
        .uri("/github-activity?u=octocat")
        .header("origin", ORIGIN)
        .body(Body::empty())
        .expect("request");
    let (status, headers, body) = send(&state, preflight).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());
    assert_eq!(headers.get("access-control-allow-methods").unwrap(), "GET,OPTIONS");

    let post = Request::builder()
        .method("POST")
        .uri("/github-activity?u=octocat")
        .body(Body::empty())
        .expect("request");
    let (status, headers, body) = send(&state, post).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(error_code(&body), "method_not_allowed");
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");

    let (status, _, body) = send(&state, get_request("/nope", ORIGIN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "not_found");
    assert_eq!(log.calls(), 0);
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (state, _cache) = proxy_state(closed_port_base().await, CachePolicy::default());
    let (status, _, body) = send(&state, get_request("/healthz", ORIGIN)).await;
    assert_eq!(status, StatusCode::OK);
    let payload: Value = serde_json::from_slice(&body).expect("json body");
    assert_eq!(payload, json!({ "status": "ok" }));
}
