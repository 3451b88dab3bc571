use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use edge_core::envelope::{first_query_value, json_response, ApiError, ApiResult};
use edge_core::identity::CallerFingerprint;
use edge_core::metrics;
use serde_json::Value;
use std::net::SocketAddr;

use crate::tally::TallyError;
use crate::{AppState, SERVICE_NAME};

impl From<TallyError> for ApiError {
    fn from(err: TallyError) -> Self {
        match err {
            TallyError::MissingPost => ApiError::bad_request("missing_post"),
            TallyError::MissingFields => ApiError::bad_request("missing_fields"),
            TallyError::AlreadyReactedToday => {
                ApiError::new(StatusCode::CONFLICT, "already_reacted_today")
            }
            TallyError::Store(err) => {
                tracing::error!(error = %err, "reaction store failure");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "store_unavailable")
            }
        }
    }
}

fn fingerprint(
    state: &AppState,
    headers: &HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> CallerFingerprint {
    CallerFingerprint::from_request(
        headers,
        peer.map(|ConnectInfo(addr)| addr),
        state.client_ip_header.as_ref(),
    )
}

pub async fn get_reactions(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> ApiResult<Response> {
    let pairs = query.map(|Query(pairs)| pairs).unwrap_or_default();
    let post_id = first_query_value(&pairs, "post").unwrap_or_default();
    let caller = fingerprint(&state, &headers, peer);

    let snapshot = state.tally.read(&post_id, &caller).await?;
    Ok(json_response(StatusCode::OK, &snapshot))
}

pub async fn post_reaction(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let payload: Value =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request("bad_json"))?;
    // Non-string fields count as missing.
    let post_id = payload
        .get("postId")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let reaction = payload
        .get("reaction")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let caller = fingerprint(&state, &headers, peer);
    match state.tally.record(post_id, reaction, &caller).await {
        Ok(snapshot) => {
            metrics::inc_reaction_recorded(SERVICE_NAME);
            Ok(json_response(StatusCode::OK, &snapshot))
        }
        Err(TallyError::AlreadyReactedToday) => {
            metrics::inc_reaction_rejected(SERVICE_NAME, "already_reacted_today");
            Err(TallyError::AlreadyReactedToday.into())
        }
        Err(err) => Err(err.into()),
    }
}
