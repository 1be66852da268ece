//! # Relay Gateway
//!
//! A reverse-proxy API gateway: path-prefix routing, load balancing,
//! per-service circuit breaking, sliding-window rate limiting, health
//! checking and service-discovery reconciliation in front of a pool of
//! backend instances.
//!
//! ## Quick start
//!
//! ```no_run
//! use relay_gateway::core::config::GatewayConfig;
//! use relay_gateway::gateway::server::GatewayServer;
//!
//! #[tokio::main]
//! async fn main() -> relay_gateway::core::error::GatewayResult<()> {
//!     let config = GatewayConfig::load_from_file("gateway.yaml").await?;
//!     GatewayServer::new(config).await?.run().await
//! }
//! ```

pub mod auth;
pub mod core;
pub mod discovery;
pub mod gateway;
pub mod health;
pub mod load_balancing;
pub mod observability;
pub mod rate_limit;

pub use crate::core::circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use crate::core::config::GatewayConfig;
pub use crate::core::error::{GatewayError, GatewayResult};
pub use crate::core::types::{Service, ServiceInstance, ServiceRegistry};
pub use gateway::server::GatewayServer;
pub use load_balancing::{LoadBalancer, Strategy};
