//! # Observability Module
//!
//! Tracing setup, Prometheus metrics wiring and the payload types served by
//! the gateway's own `/health` endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::error::{GatewayError, GatewayResult};

pub const METRIC_REQUESTS: &str = "gateway_requests_total";
pub const METRIC_REQUEST_DURATION: &str = "gateway_request_duration_seconds";
pub const METRIC_ACTIVE_CONNECTIONS: &str = "gateway_active_connections";
pub const METRIC_RATE_LIMIT_HITS: &str = "gateway_rate_limit_hits_total";
pub const METRIC_BREAKER_REJECTIONS: &str = "gateway_breaker_rejections_total";
pub const METRIC_UPSTREAM_ERRORS: &str = "gateway_upstream_errors_total";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the tracing subscriber
///
/// `GATEWAY_LOG_LEVEL` or `RUST_LOG` override the default filter. `json`
/// switches the output format for log aggregation setups.
pub fn init_tracing(json: bool) {
    let filter = std::env::var("GATEWAY_LOG_LEVEL")
        .map(EnvFilter::new)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("relay_gateway=info,tower_http=warn"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Install the Prometheus recorder once per process and return its handle
///
/// Safe to call repeatedly (integration tests build the app many times);
/// every call after the first returns the already-installed handle.
pub fn init_metrics() -> GatewayResult<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| GatewayError::internal(format!("metrics recorder: {}", e)))?;

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Record the outcome of one proxied request
pub fn record_request(service: &str, method: &str, status: u16, duration: Duration) {
    let labels = [
        ("service", service.to_string()),
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];
    metrics::counter!(METRIC_REQUESTS, &labels).increment(1);
    metrics::histogram!(METRIC_REQUEST_DURATION, &labels).record(duration.as_secs_f64());
}

/// Track in-flight proxied requests per service
pub fn connection_opened(service: &str) {
    metrics::gauge!(METRIC_ACTIVE_CONNECTIONS, "service" => service.to_string()).increment(1.0);
}

pub fn connection_closed(service: &str) {
    metrics::gauge!(METRIC_ACTIVE_CONNECTIONS, "service" => service.to_string()).decrement(1.0);
}

/// Count a rejected-by-quota request
pub fn record_rate_limit_hit(service: &str, rule: &'static str) {
    metrics::counter!(
        METRIC_RATE_LIMIT_HITS,
        "service" => service.to_string(),
        "rule" => rule
    )
    .increment(1);
}

/// Count a breaker fail-fast rejection
pub fn record_breaker_rejection(service: &str) {
    metrics::counter!(METRIC_BREAKER_REJECTIONS, "service" => service.to_string()).increment(1);
}

/// Count an upstream failure by error category
pub fn record_upstream_error(service: &str, error_type: &'static str) {
    metrics::counter!(
        METRIC_UPSTREAM_ERRORS,
        "service" => service.to_string(),
        "error" => error_type
    )
    .increment(1);
}

/// Body of the gateway's own `/health` endpoint
///
/// Always served with HTTP 200; degradation is reported in the body so
/// orchestrators polling the endpoint can keep scraping it.
#[derive(Debug, Serialize)]
pub struct GatewayHealth {
    /// "healthy" when every service has at least one healthy instance
    pub status: &'static str,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Keyed by service name
    pub services: BTreeMap<String, ServiceHealth>,
}

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub healthy_instances: usize,
    pub total_instances: usize,
    /// Circuit breaker state: "closed", "open" or "half_open"
    pub breaker_state: &'static str,
}
