//! # Gateway Server
//!
//! Assembles the shared state, the axum router and the background loops,
//! and runs the listener until shutdown.

use axum::extract::State;
use axum::http::{HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::auth::Authenticator;
use crate::core::circuit_breaker::CircuitBreakerRegistry;
use crate::core::config::{CorsConfig, DiscoveryKind, GatewayConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceRegistry;
use crate::discovery::{backend_from_config, Reconciler};
use crate::gateway::{proxy, GatewayState};
use crate::health::HealthChecker;
use crate::load_balancing::LoadBalancer;
use crate::observability::{self, GatewayHealth, ServiceHealth};
use crate::rate_limit::RateLimiter;

/// How often idle rate-limit records are swept
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Idle time after which a rate-limit record is dropped
const LIMITER_IDLE_TTL: Duration = Duration::from_secs(600);

/// The assembled gateway, ready to serve
pub struct GatewayServer {
    state: Arc<GatewayState>,
    shutdown: CancellationToken,
}

impl GatewayServer {
    /// Build all collaborators from validated configuration
    pub async fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let registry = Arc::new(ServiceRegistry::from_configs(&config.services));

        // Pre-create breakers so the health endpoint can report their state
        // before the first proxied request.
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        for service in registry.all() {
            let mut breaker_config = service.breaker_config.clone();
            breaker_config.call_timeout = service.timeout;
            breakers.get_or_create(&service.name, &breaker_config);
        }

        let limiter = match &config.redis_url {
            Some(url) => {
                info!("rate limiting backed by redis");
                RateLimiter::redis(url).await?
            }
            None => RateLimiter::in_memory(),
        };

        let authenticator = Authenticator::new(config.authentication.clone())?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::internal(format!("proxy client: {}", e)))?;

        let metrics = observability::init_metrics()?;

        let state = Arc::new(GatewayState {
            config,
            registry,
            breakers,
            balancer: LoadBalancer::new(),
            limiter,
            authenticator,
            client,
            metrics,
        });

        Ok(Self {
            state,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    /// Build the router: gateway endpoints plus the proxy fallback
    pub fn app(&self) -> GatewayResult<Router> {
        let cors = cors_layer(&self.state.config.cors)?;

        Ok(Router::new()
            .route("/health", get(health))
            .route("/metrics", get(render_metrics))
            .fallback(proxy::handle)
            .layer(cors)
            .with_state(self.state.clone()))
    }

    /// Spawn the health, discovery and sweep loops
    fn spawn_background(&self) -> GatewayResult<()> {
        let health_checker = HealthChecker::new(
            self.state.registry.clone(),
            self.state.config.health_check_interval,
        )?;
        tokio::spawn(health_checker.run(self.shutdown.clone()));

        if self.state.config.service_discovery.kind != DiscoveryKind::Static {
            let backend = backend_from_config(&self.state.config.service_discovery)?;
            let reconciler = Reconciler::new(
                self.state.registry.clone(),
                backend,
                self.state.config.discovery_interval,
            );
            tokio::spawn(reconciler.run(self.shutdown.clone()));
        }

        let state = self.state.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LIMITER_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = state.limiter.evict_idle(LIMITER_IDLE_TTL);
                        if evicted > 0 {
                            info!(evicted, "swept idle rate limit records");
                        }
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        });

        Ok(())
    }

    /// Serve until SIGINT/SIGTERM, then stop the background loops
    pub async fn run(self) -> GatewayResult<()> {
        let app = self.app()?;
        self.spawn_background()?;

        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(
            addr = %addr,
            services = self.state.registry.len(),
            "gateway listening"
        );

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        self.shutdown.cancel();
        info!("gateway stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => warn!(error = %err, "failed to listen for sigterm"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received sigterm, shutting down"),
    }
}

/// Gateway health: degraded when any service has no healthy instance.
/// Always HTTP 200; the status field carries the verdict.
async fn health(State(state): State<Arc<GatewayState>>) -> Response {
    let mut degraded = false;
    let mut services = BTreeMap::new();

    for service in state.registry.all() {
        let total = service.instances().len();
        let healthy = service.healthy_instances().len();
        if healthy == 0 {
            degraded = true;
        }
        let breaker_state = state
            .breakers
            .get(&service.name)
            .map(|b| b.stats().state)
            .unwrap_or("closed");

        services.insert(
            service.name.clone(),
            ServiceHealth {
                healthy_instances: healthy,
                total_instances: total,
                breaker_state,
            },
        );
    }

    let body = GatewayHealth {
        status: if degraded { "degraded" } else { "healthy" },
        timestamp: chrono::Utc::now(),
        services,
    };

    Json(body).into_response()
}

async fn render_metrics(State(state): State<Arc<GatewayState>>) -> String {
    state.metrics.render()
}

/// Translate CORS configuration into the tower-http layer
fn cors_layer(config: &CorsConfig) -> GatewayResult<CorsLayer> {
    let mut layer = CorsLayer::new();

    if config.allow_origins.iter().any(|o| o == "*") {
        layer = layer.allow_origin(AllowOrigin::from(Any));
    } else {
        let origins = config
            .allow_origins
            .iter()
            .map(|o| {
                o.parse::<HeaderValue>()
                    .map_err(|_| GatewayError::config(format!("invalid cors origin: {}", o)))
            })
            .collect::<GatewayResult<Vec<_>>>()?;
        layer = layer.allow_origin(origins);
    }

    if config.allow_methods.iter().any(|m| m == "*") {
        layer = layer.allow_methods(AllowMethods::from(Any));
    } else {
        let methods = config
            .allow_methods
            .iter()
            .map(|m| {
                m.to_uppercase()
                    .parse::<Method>()
                    .map_err(|_| GatewayError::config(format!("invalid cors method: {}", m)))
            })
            .collect::<GatewayResult<Vec<_>>>()?;
        layer = layer.allow_methods(methods);
    }

    if config.allow_headers.iter().any(|h| h == "*") {
        layer = layer.allow_headers(AllowHeaders::from(Any));
    } else {
        let headers = config
            .allow_headers
            .iter()
            .map(|h| {
                h.parse::<axum::http::HeaderName>()
                    .map_err(|_| GatewayError::config(format!("invalid cors header: {}", h)))
            })
            .collect::<GatewayResult<Vec<_>>>()?;
        layer = layer.allow_headers(headers);
    }

    if config.allow_credentials {
        layer = layer.allow_credentials(true);
    }

    Ok(layer)
}
