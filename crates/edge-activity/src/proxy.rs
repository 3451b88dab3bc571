//! Pull-through cache for the contributions API.
//!
//! Requests are normalized before anything else so the cache-key space stays
//! bounded: the username is trimmed and length-checked, and the year is
//! clamped to `last` or an integer in [`MIN_YEAR`, `MAX_YEAR`]. The cache key
//! is the normalized upstream URL itself.

use axum::http::StatusCode;
use edge_core::edge_cache::{CachedResponse, EdgeCache};
use edge_core::envelope::{ApiError, JSON_CONTENT_TYPE};
use edge_core::metrics::{self, CACHE_RESULT_HIT, CACHE_RESULT_MISS};
use reqwest::header::ACCEPT;
use reqwest::Url;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::SERVICE_NAME;

pub const DEFAULT_UPSTREAM_BASE: &str = "https://github-contributions-api.jogruber.de/v4/";
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_USERNAME_CHARS: usize = 64;
pub const YEAR_LAST: &str = "last";
pub const MIN_YEAR: i64 = 2008;
pub const MAX_YEAR: i64 = 2100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("username is required")]
    MissingUser,
    #[error("username is too long")]
    BadUser,
    #[error("upstream did not answer in time")]
    UpstreamTimeout,
    #[error("upstream returned a non-json body")]
    BadUpstreamJson,
    #[error("upstream failed: {}", .0.as_deref().unwrap_or("upstream_failed"))]
    UpstreamFailed(Option<String>),
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::MissingUser => ApiError::bad_request("missing_user"),
            ProxyError::BadUser => ApiError::bad_request("bad_user"),
            ProxyError::UpstreamTimeout => {
                ApiError::new(StatusCode::GATEWAY_TIMEOUT, "upstream_timeout")
            }
            ProxyError::BadUpstreamJson => ApiError::new(StatusCode::BAD_GATEWAY, "bad_upstream_json"),
            ProxyError::UpstreamFailed(Some(upstream)) => {
                ApiError::new(StatusCode::BAD_GATEWAY, upstream)
            }
            ProxyError::UpstreamFailed(None) => {
                ApiError::new(StatusCode::BAD_GATEWAY, "upstream_failed")
            }
        }
    }
}

/// Total and idempotent: every input maps to `last` or a year in range.
pub fn normalize_year(input: Option<&str>) -> String {
    let Some(raw) = input.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return YEAR_LAST.to_string();
    };
    if raw == YEAR_LAST {
        return YEAR_LAST.to_string();
    }
    match parse_number(raw) {
        Some(value) if value.is_finite() => {
            let year = value.floor();
            if year < MIN_YEAR as f64 || year > MAX_YEAR as f64 {
                YEAR_LAST.to_string()
            } else {
                (year as i64).to_string()
            }
        }
        _ => YEAR_LAST.to_string(),
    }
}

/// Decimal, exponent and `0x`/`0o`/`0b` forms, as browsers read a number.
fn parse_number(raw: &str) -> Option<f64> {
    const PREFIXES: [(&str, u32); 6] = [
        ("0x", 16),
        ("0X", 16),
        ("0o", 8),
        ("0O", 8),
        ("0b", 2),
        ("0B", 2),
    ];
    for (prefix, radix) in PREFIXES {
        if let Some(digits) = raw.strip_prefix(prefix) {
            if digits.is_empty() || !digits.chars().all(|digit| digit.is_digit(radix)) {
                return None;
            }
            return u64::from_str_radix(digits, radix).ok().map(|value| value as f64);
        }
    }
    raw.parse::<f64>().ok()
}

pub fn normalize_user(input: Option<&str>) -> Result<String, ProxyError> {
    let user = input.map(str::trim).unwrap_or_default();
    if user.is_empty() {
        return Err(ProxyError::MissingUser);
    }
    // Dot segments would be collapsed out of the upstream path.
    if user.chars().count() > MAX_USERNAME_CHARS || user == "." || user == ".." {
        return Err(ProxyError::BadUser);
    }
    Ok(user.to_string())
}

/// `<base>/<escaped user>?y=<year>`. `base` must be a hierarchical URL.
pub fn upstream_url(base: &Url, username: &str, year: &str) -> Url {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push(username);
    }
    url.set_query(None);
    url.query_pairs_mut().append_pair("y", year);
    url
}

/// Layered freshness: short for browsers, long for shared caches, plus a
/// stale-while-revalidate allowance. The edge cache keeps entries for
/// `shared_max_age`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachePolicy {
    pub browser_max_age: Duration,
    pub shared_max_age: Duration,
    pub stale_while_revalidate: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            browser_max_age: Duration::from_secs(60),
            shared_max_age: Duration::from_secs(60 * 60 * 6),
            stale_while_revalidate: Duration::from_secs(60 * 60 * 24),
        }
    }
}

impl CachePolicy {
    pub fn header_value(&self) -> String {
        format!(
            "public, max-age={}, s-maxage={}, stale-while-revalidate={}",
            self.browser_max_age.as_secs(),
            self.shared_max_age.as_secs(),
            self.stale_while_revalidate.as_secs()
        )
    }
}

pub struct ActivityProxy {
    client: reqwest::Client,
    base: Url,
    cache: Arc<dyn EdgeCache>,
    policy: CachePolicy,
}

impl ActivityProxy {
    pub fn new(
        base: Url,
        timeout: Duration,
        cache: Arc<dyn EdgeCache>,
        policy: CachePolicy,
    ) -> anyhow::Result<Self> {
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            anyhow::bail!("upstream base must be an http(s) url: {base}");
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base,
            cache,
            policy,
        })
    }

    pub async fn fetch(
        &self,
        user: Option<&str>,
        year: Option<&str>,
    ) -> Result<CachedResponse, ProxyError> {
        let user = normalize_user(user)?;
        let year = normalize_year(year);
        let url = upstream_url(&self.base, &user, &year);
        let cache_key = url.as_str().to_string();

        if let Some(hit) = self.cache.lookup(&cache_key).await {
            metrics::inc_edge_cache_lookup(SERVICE_NAME, CACHE_RESULT_HIT);
            tracing::debug!(key = %cache_key, "edge cache hit");
            return Ok(hit);
        }
        metrics::inc_edge_cache_lookup(SERVICE_NAME, CACHE_RESULT_MISS);
        tracing::debug!(key = %cache_key, "edge cache miss");

        let fresh = self.fetch_upstream(url).await?;
        self.cache
            .store(&cache_key, fresh.clone(), self.policy.shared_max_age)
            .await;
        Ok(fresh)
    }

    async fn fetch_upstream(&self, url: Url) -> Result<CachedResponse, ProxyError> {
        let start = Instant::now();
        let outcome = self.call_upstream(url.clone()).await;
        let result = match &outcome {
            Ok(_) => "ok",
            Err(ProxyError::UpstreamTimeout) => "timeout",
            Err(ProxyError::BadUpstreamJson) => "bad_json",
            Err(_) => "failed",
        };
        metrics::record_upstream_request(SERVICE_NAME, result, start.elapsed());
        if let Err(err) = &outcome {
            tracing::warn!(upstream = %url, error = %err, "upstream fetch failed");
        }
        outcome
    }

    async fn call_upstream(&self, url: Url) -> Result<CachedResponse, ProxyError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|_| ProxyError::UpstreamTimeout)?;

        let status = response.status();
        let body = response.bytes().await.map_err(|err| {
            if err.is_timeout() {
                ProxyError::UpstreamTimeout
            } else {
                ProxyError::BadUpstreamJson
            }
        })?;

        let parsed: Value =
            serde_json::from_slice(&body).map_err(|_| ProxyError::BadUpstreamJson)?;
        if !status.is_success() {
            let upstream_error = parsed
                .get("error")
                .and_then(Value::as_str)
                .filter(|message| !message.is_empty())
                .map(str::to_string);
            return Err(ProxyError::UpstreamFailed(upstream_error));
        }

        Ok(CachedResponse {
            content_type: JSON_CONTENT_TYPE.to_string(),
            cache_control: self.policy.header_value(),
            body,
        })
    }
}
