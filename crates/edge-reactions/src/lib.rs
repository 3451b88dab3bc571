use anyhow::{anyhow, Result};
use axum::extract::State;
use axum::http::{HeaderName, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use edge_core::date_bucket::{BucketZone, DEFAULT_TIMEZONE};
use edge_core::envelope::{method_not_allowed_fallback, not_found_fallback, CorsPolicy};
use edge_core::identity::DEFAULT_CLIENT_IP_HEADER;
use edge_core::db::DbConfig;
use edge_core::kv::{self, KvStore, MemoryKvStore};
use edge_core::kv_postgres::{self, PgKvStore};
use edge_core::{config, db, http, logging, metrics, server};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

mod reactions;
pub mod tally;


use tally::ReactionTally;

pub const SERVICE_NAME: &str = "edge-reactions";
const CORS: CorsPolicy = CorsPolicy::new("GET,POST,OPTIONS");

#[derive(Clone)]
pub struct AppState {
    tally: Arc<ReactionTally>,
    store: Arc<dyn KvStore>,
    client_ip_header: Option<HeaderName>,
}

impl AppState {
    pub fn new(
        tally: Arc<ReactionTally>,
        store: Arc<dyn KvStore>,
        client_ip_header: Option<HeaderName>,
    ) -> Self {
        Self {
            tally,
            store,
            client_ip_header,
        }
    }
}

#[derive(Serialize)]
struct HealthStatus {
    status: String,
}

pub struct ReactionsConfig {
    pub addr: SocketAddr,
    pub database: Option<DbConfig>,
    pub salt: String,
    pub timezone: String,
    pub client_ip_header: Option<HeaderName>,
    pub kv_purge_interval: Duration,
}

pub fn load_config() -> Result<ReactionsConfig> {
    let addr = config::socket_addr_from_env("REACTIONS_API_ADDR", "0.0.0.0:8787")?;
    let database = DbConfig::from_env()?;
    let salt = config::required_env("REACTIONS_SALT")?;
    let timezone =
        config::optional_env("REACTIONS_TIMEZONE").unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
    let client_ip_header = client_ip_header_from_env("REACTIONS_CLIENT_IP_HEADER")?;
    let kv_purge_interval =
        Duration::from_secs(config::u64_from_env("REACTIONS_KV_PURGE_SECONDS", 600)?.max(60));
    Ok(ReactionsConfig {
        addr,
        database,
        salt,
        timezone,
        client_ip_header,
        kv_purge_interval,
    })
}

/// Unset selects the default header; an explicitly blank value disables it.
fn client_ip_header_from_env(name: &str) -> Result<Option<HeaderName>> {
    let raw = match std::env::var(name) {
        Ok(value) => value,
        Err(_) => DEFAULT_CLIENT_IP_HEADER.to_string(),
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    HeaderName::from_bytes(raw.to_ascii_lowercase().as_bytes())
        .map(Some)
        .map_err(|err| anyhow!("invalid header name for {name}: {err}"))
}

pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .route(
            "/reactions",
            get(reactions::get_reactions)
                .post(reactions::post_reaction)
                .fallback(method_not_allowed_fallback),
        )
        .fallback(not_found_fallback)
        .with_state(state);

    http::apply_standard_layers(router, SERVICE_NAME, CORS)
}

pub async fn run(config: ReactionsConfig) -> Result<()> {
    logging::init(SERVICE_NAME);
    metrics::init(SERVICE_NAME);

    let store: Arc<dyn KvStore> = match &config.database {
        Some(database) => {
            let pool = db::connect(database).await?;
            let store = Arc::new(PgKvStore::new(pool));
            kv_postgres::spawn_purge_loop(Arc::clone(&store), config.kv_purge_interval);
            store as Arc<dyn KvStore>
        }
        None => {
            tracing::warn!("DATABASE_URL not set, reactions are kept in process memory");
            let store = Arc::new(MemoryKvStore::new());
            kv::spawn_purge_loop(Arc::clone(&store), config.kv_purge_interval);
            store as Arc<dyn KvStore>
        }
    };

    let zone = BucketZone::parse(&config.timezone);
    let tally = Arc::new(ReactionTally::new(Arc::clone(&store), config.salt, zone));
    let state = AppState::new(tally, store, config.client_ip_header);

    server::serve(config.addr, build_router(state)).await
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.check_ready().await {
        Ok(_) => (StatusCode::OK, Json(HealthStatus { status: "ok".into() })),
        Err(err) => {
            tracing::warn!(error = %err, "kv store not ready");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthStatus {
                    status: "unavailable".into(),
                }),
            )
        }
    }
}

async fn metrics_endpoint() -> impl IntoResponse {
    metrics::metrics_response(SERVICE_NAME)
}
