//! # Gateway Module
//!
//! The HTTP front door: server assembly, routing and the proxy pipeline
//! every request flows through.

pub mod proxy;
pub mod server;

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::auth::Authenticator;
use crate::core::circuit_breaker::CircuitBreakerRegistry;
use crate::core::config::GatewayConfig;
use crate::core::types::ServiceRegistry;
use crate::load_balancing::LoadBalancer;
use crate::rate_limit::RateLimiter;

/// Shared state handed to every request handler
pub struct GatewayState {
    pub config: GatewayConfig,
    pub registry: Arc<ServiceRegistry>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub balancer: LoadBalancer,
    pub limiter: RateLimiter,
    pub authenticator: Authenticator,
    pub client: reqwest::Client,
    pub metrics: PrometheusHandle,
}
