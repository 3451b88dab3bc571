use axum::extract::MatchedPath;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::{Layer, Service};

struct Metrics {
    registry: Registry,
    edge_up: IntGaugeVec,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    reactions_recorded_total: IntCounterVec,
    reactions_rejected_total: IntCounterVec,
    edge_cache_lookups_total: IntCounterVec,
    upstream_requests_total: IntCounterVec,
    upstream_request_duration_seconds: HistogramVec,
}

pub const CACHE_RESULT_HIT: &str = "hit";
pub const CACHE_RESULT_MISS: &str = "miss";

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let registry = Registry::new();

        let edge_up = IntGaugeVec::new(Opts::new("edge_up", "Service health"), &["service"])
            .expect("edge_up metric");

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "HTTP request count"),
            &["service", "route", "method", "status"],
        )
        .expect("http_requests_total metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["service", "route", "method", "status"],
        )
        .expect("http_request_duration_seconds metric");

        let reactions_recorded_total = IntCounterVec::new(
            Opts::new("reactions_recorded_total", "Reactions accepted and counted"),
            &["service"],
        )
        .expect("reactions_recorded_total metric");

        let reactions_rejected_total = IntCounterVec::new(
            Opts::new("reactions_rejected_total", "Reactions rejected before counting"),
            &["service", "reason"],
        )
        .expect("reactions_rejected_total metric");

        let edge_cache_lookups_total = IntCounterVec::new(
            Opts::new("edge_cache_lookups_total", "Edge cache lookups by result"),
            &["service", "result"],
        )
        .expect("edge_cache_lookups_total metric");

        let upstream_requests_total = IntCounterVec::new(
            Opts::new("upstream_requests_total", "Upstream fetches by outcome"),
            &["service", "result"],
        )
        .expect("upstream_requests_total metric");

        let upstream_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "upstream_request_duration_seconds",
                "Upstream fetch duration in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["service"],
        )
        .expect("upstream_request_duration_seconds metric");

        registry
            .register(Box::new(edge_up.clone()))
            .expect("register edge_up");
        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("register http_requests_total");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("register http_request_duration_seconds");
        registry
            .register(Box::new(reactions_recorded_total.clone()))
            .expect("register reactions_recorded_total");
        registry
            .register(Box::new(reactions_rejected_total.clone()))
            .expect("register reactions_rejected_total");
        registry
            .register(Box::new(edge_cache_lookups_total.clone()))
            .expect("register edge_cache_lookups_total");
        registry
            .register(Box::new(upstream_requests_total.clone()))
            .expect("register upstream_requests_total");
        registry
            .register(Box::new(upstream_request_duration_seconds.clone()))
            .expect("register upstream_request_duration_seconds");

        Metrics {
            registry,
            edge_up,
            http_requests_total,
            http_request_duration_seconds,
            reactions_recorded_total,
            reactions_rejected_total,
            edge_cache_lookups_total,
            upstream_requests_total,
            upstream_request_duration_seconds,
        }
    })
}

pub fn init(service_name: &'static str) {
    metrics().edge_up.with_label_values(&[service_name]).set(1);
}

pub fn record_http_request(
    service_name: &'static str,
    method: &str,
    route: &str,
    status: u16,
    duration: Duration,
) {
    let status_str = status.to_string();
    let labels = &[service_name, route, method, status_str.as_str()];
    let metrics = metrics();
    metrics.http_requests_total.with_label_values(labels).inc();
    metrics
        .http_request_duration_seconds
        .with_label_values(labels)
        .observe(duration.as_secs_f64());
}

pub fn inc_reaction_recorded(service_name: &'static str) {
    metrics()
        .reactions_recorded_total
        .with_label_values(&[service_name])
        .inc();
}

pub fn inc_reaction_rejected(service_name: &'static str, reason: &'static str) {
    metrics()
        .reactions_rejected_total
        .with_label_values(&[service_name, reason])
        .inc();
}

pub fn inc_edge_cache_lookup(service_name: &'static str, result: &'static str) {
    metrics()
        .edge_cache_lookups_total
        .with_label_values(&[service_name, result])
        .inc();
}

pub fn record_upstream_request(service_name: &'static str, result: &str, duration: Duration) {
    let metrics = metrics();
    metrics
        .upstream_requests_total
        .with_label_values(&[service_name, result])
        .inc();
    metrics
        .upstream_request_duration_seconds
        .with_label_values(&[service_name])
        .observe(duration.as_secs_f64());
}

pub fn metrics_response(service_name: &'static str) -> impl IntoResponse {
    init(service_name);
    let metrics = metrics();
    let metric_families = metrics.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            HeaderMap::new(),
            "failed to encode metrics".to_string(),
        );
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    (
        StatusCode::OK,
        headers,
        String::from_utf8_lossy(&buffer).to_string(),
    )
}

#[derive(Clone)]
pub struct MetricsLayer {
    service_name: &'static str,
}

impl MetricsLayer {
    pub fn new(service_name: &'static str) -> Self {
        Self { service_name }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    service_name: &'static str,
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            service_name: self.service_name,
        }
    }
}

impl<S, ReqBody, ResBody> Service<axum::http::Request<ReqBody>> for MetricsService<S>
where
    S: Service<axum::http::Request<ReqBody>, Response = axum::response::Response<ResBody>>
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = axum::response::Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: axum::http::Request<ReqBody>) -> Self::Future {
        let service_name = self.service_name;
        let method = request.method().to_string();
        // Matched route template keeps label cardinality bounded.
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|path| path.as_str().to_string())
            .unwrap_or_else(|| "unmatched".to_string());
        let start = Instant::now();
        let fut = self.inner.call(request);
        Box::pin(async move {
            match fut.await {
                Ok(response) => {
                    record_http_request(
                        service_name,
                        &method,
                        &route,
                        response.status().as_u16(),
                        start.elapsed(),
                    );
                    Ok(response)
                }
                Err(err) => {
                    record_http_request(service_name, &method, &route, 500, start.elapsed());
                    Err(err)
                }
            }
        })
    }
}
