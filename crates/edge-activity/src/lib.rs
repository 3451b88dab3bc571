use anyhow::{anyhow, Result};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use edge_core::edge_cache::{self, CachedResponse, EdgeCache, MemoryEdgeCache};
use edge_core::envelope::{
    first_query_value, method_not_allowed_fallback, not_found_fallback, ApiResult, CorsPolicy,
};
use edge_core::{config, http, logging, metrics, server};
use reqwest::Url;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub mod proxy;

#[cfg(test)]
mod contract_tests;

use proxy::{ActivityProxy, CachePolicy, DEFAULT_UPSTREAM_BASE};

pub const SERVICE_NAME: &str = "edge-activity";
const CORS: CorsPolicy = CorsPolicy::new("GET,OPTIONS");

#[derive(Clone)]
pub struct AppState {
    proxy: Arc<ActivityProxy>,
}

impl AppState {
    pub fn new(proxy: Arc<ActivityProxy>) -> Self {
        Self { proxy }
    }
}

#[derive(Serialize)]
struct HealthStatus {
    status: String,
}

pub struct ActivityConfig {
    pub addr: SocketAddr,
    pub upstream_base: Url,
    pub upstream_timeout: Duration,
    pub cache_capacity: usize,
}

pub fn load_config() -> Result<ActivityConfig> {
    let addr = config::socket_addr_from_env("ACTIVITY_PROXY_ADDR", "0.0.0.0:8788")?;
    let raw_base = config::optional_env("ACTIVITY_UPSTREAM_BASE")
        .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE.to_string());
    let upstream_base = Url::parse(&raw_base)
        .map_err(|err| anyhow!("invalid ACTIVITY_UPSTREAM_BASE {raw_base}: {err}"))?;
    let upstream_timeout = Duration::from_millis(config::u64_from_env(
        "ACTIVITY_UPSTREAM_TIMEOUT_MS",
        proxy::DEFAULT_UPSTREAM_TIMEOUT.as_millis() as u64,
    )?);
    let cache_capacity = config::u64_from_env(
        "ACTIVITY_CACHE_CAPACITY",
        edge_cache::DEFAULT_CAPACITY as u64,
    )?
    .max(1) as usize;
    Ok(ActivityConfig {
        addr,
        upstream_base,
        upstream_timeout,
        cache_capacity,
    })
}

pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .route(
            "/github-activity",
            get(github_activity).fallback(method_not_allowed_fallback),
        )
        .fallback(not_found_fallback)
        .with_state(state);

    http::apply_standard_layers(router, SERVICE_NAME, CORS)
}

pub async fn run(config: ActivityConfig) -> Result<()> {
    logging::init(SERVICE_NAME);
    metrics::init(SERVICE_NAME);

    let cache: Arc<dyn EdgeCache> = Arc::new(MemoryEdgeCache::new(config.cache_capacity));
    let proxy = ActivityProxy::new(
        config.upstream_base,
        config.upstream_timeout,
        cache,
        CachePolicy::default(),
    )?;
    let state = AppState::new(Arc::new(proxy));

    server::serve(config.addr, build_router(state)).await
}

async fn github_activity(
    State(state): State<AppState>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> ApiResult<Response> {
    let pairs = query.map(|Query(pairs)| pairs).unwrap_or_default();
    let user = first_query_value(&pairs, "u");
    let year = first_query_value(&pairs, "y");
    let cached = state
        .proxy
        .fetch(user.as_deref(), year.as_deref())
        .await?;
    Ok(cached_into_response(cached))
}

fn cached_into_response(cached: CachedResponse) -> Response {
    (
        StatusCode::OK,
        [
            (CONTENT_TYPE, cached.content_type),
            (CACHE_CONTROL, cached.cache_control),
        ],
        cached.body,
    )
        .into_response()
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthStatus { status: "ok".into() }))
}

async fn metrics_endpoint() -> impl IntoResponse {
    metrics::metrics_response(SERVICE_NAME)
}
