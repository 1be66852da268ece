//! # Error Handling Module
//!
//! Defines every error category the gateway can surface, with the HTTP status
//! mapping clients observe and the classification the circuit breaker uses.
//!
//! The taxonomy is deliberately small: each variant corresponds to one
//! user-visible failure category. Everything is caught at the dispatch
//! boundary and translated into a JSON response with a `detail` field;
//! internal stack traces never leak to clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error categories for the gateway request path and background loops
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// No service matches the request path
    #[error("no matching service for path: {path}")]
    RouteNotFound { path: String },

    /// A service matched but does not allow this HTTP method
    #[error("method {method} not allowed for service {service}")]
    MethodNotAllowed { method: String, service: String },

    /// Missing, invalid or expired credentials
    #[error("authentication failed: {reason}")]
    Authentication { reason: String },

    /// Request rate exceeded the configured limit for this identifier
    #[error("rate limit exceeded: {limit} requests per {window_secs}s")]
    RateLimitExceeded { limit: u32, window_secs: u64 },

    /// Circuit breaker rejected the call without attempting backend I/O
    #[error("circuit breaker open for service: {service}")]
    CircuitOpen { service: String },

    /// Load balancer found no healthy instance for the service
    #[error("no healthy instances for service: {service}")]
    NoHealthyInstance { service: String },

    /// The proxied call did not complete within the service timeout
    #[error("upstream timeout for service {service} after {timeout_ms}ms")]
    UpstreamTimeout { service: String, timeout_ms: u64 },

    /// DNS failure, connection refused, reset, or similar transport error
    #[error("upstream connection error for service {service}: {message}")]
    UpstreamConnection { service: String, message: String },

    /// Service discovery backend errors
    #[error("service discovery error: {message}")]
    Discovery { message: String },

    /// Anything else in the proxy path
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an authentication error with a custom reason
    pub fn auth<S: Into<String>>(reason: S) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    /// Create a service discovery error with a custom message
    pub fn discovery<S: Into<String>>(message: S) -> Self {
        Self::Discovery {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify a reqwest failure on the proxy path into the gateway taxonomy
    pub fn from_upstream(service: &str, err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::UpstreamTimeout {
                service: service.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else if err.is_connect() || err.is_request() {
            Self::UpstreamConnection {
                service: service.to_string(),
                message: err.to_string(),
            }
        } else {
            Self::Internal {
                message: format!("upstream request failed: {}", err),
            }
        }
    }

    /// HTTP status code returned to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::NoHealthyInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamConnection { .. } => StatusCode::BAD_GATEWAY,
            Self::Discovery { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// String tag for the error category in API responses and metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::RouteNotFound { .. } => "route_not_found",
            Self::MethodNotAllowed { .. } => "method_not_allowed",
            Self::Authentication { .. } => "authentication_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NoHealthyInstance { .. } => "no_healthy_instance",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamConnection { .. } => "upstream_connection_error",
            Self::Discovery { .. } => "service_discovery_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Whether this error counts toward opening the circuit breaker
    ///
    /// Only failures that indicate an unhealthy upstream count. Client-side
    /// rejections (auth, rate limit, routing) never trip the breaker, and
    /// neither does the breaker's own fail-fast rejection.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout { .. }
                | Self::UpstreamConnection { .. }
                | Self::Internal { .. }
        )
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

/// Convert errors into HTTP responses at the dispatch boundary
///
/// Every gateway-level failure body carries a `detail` field describing the
/// failure category, per the external interface contract.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "detail": self.to_string(),
            "type": self.error_type(),
        });
        (status, Json(body)).into_response()
    }
}
