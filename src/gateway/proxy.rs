//! # Proxy Pipeline
//!
//! The single handler every proxied request flows through:
//! route match, method check, authentication, rate limiting, then the
//! breaker-guarded forward to a load-balanced backend instance.
//!
//! axum speaks `http` 1.x while reqwest 0.11 still uses `http` 0.2, so
//! methods, headers and status codes are converted by value at the
//! boundary in both directions.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::core::config::RateLimitKey;
use crate::core::error::GatewayError;
use crate::core::types::{ConnectionGuard, Service, ServiceInstance};
use crate::gateway::GatewayState;
use crate::observability;
use crate::rate_limit::RateLimitDecision;

/// Upper bound on buffered request bodies
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Request headers never forwarded to the backend
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Response headers dropped because the gateway re-frames the body.
/// `content-encoding` stays: the upstream client never decompresses, so the
/// body passes through exactly as encoded and the header must describe it.
const RESPONSE_SKIP: &[&str] = &["transfer-encoding", "content-length", "connection"];

/// Backend reply, buffered and version-agnostic
struct UpstreamResponse {
    status: u16,
    headers: reqwest::header::HeaderMap,
    body: Bytes,
}

/// Fallback handler: everything not matched by the gateway's own routes
pub async fn handle(State(state): State<Arc<GatewayState>>, req: Request) -> Response {
    let started = Instant::now();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());
    let method = req.method().as_str().to_string();
    let client_ip = client_ip(&req);

    let service = match state.registry.match_path(&path) {
        Some(service) => service,
        None => {
            debug!(path = %path, "no route matched");
            return GatewayError::RouteNotFound { path }.into_response();
        }
    };

    if !service.allows_method(&method) {
        let err = GatewayError::MethodNotAllowed {
            method: method.clone(),
            service: service.name.clone(),
        };
        return finish_error(&service.name, &method, err, started);
    }

    // Authentication, only for services that opted in
    let auth_context = if service.authentication_required {
        match state.authenticator.authenticate(req.headers()) {
            Ok(context) => Some(context),
            Err(err) => return finish_error(&service.name, &method, err, started),
        }
    } else {
        None
    };

    // Rate limiting; a store outage fails open so the gateway keeps serving
    let mut quota: Option<RateLimitDecision> = None;
    if let Some(rule) = &service.rate_limit {
        let identifier = quota_identifier(&rule.key, client_ip, req.headers(), auth_context.as_ref());
        match state.limiter.check(&service.name, rule, &identifier).await {
            Ok(decision) if !decision.allowed => {
                observability::record_rate_limit_hit(&service.name, rule.key.as_str());
                let err = GatewayError::RateLimitExceeded {
                    limit: decision.limit,
                    window_secs: decision.window.as_secs(),
                };
                observability::record_request(
                    &service.name,
                    &method,
                    err.status_code().as_u16(),
                    started.elapsed(),
                );
                let mut response = err.into_response();
                apply_quota_headers(&mut response, &decision);
                return response;
            }
            Ok(decision) => quota = Some(decision),
            Err(err) => {
                warn!(service = %service.name, error = %err, "rate limit store unavailable, failing open");
            }
        }
    }

    // Buffer the body once so retries can resend it
    let headers = req.headers().clone();
    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let err = GatewayError::internal(format!("failed to read request body: {}", err));
            return finish_error(&service.name, &method, err, started);
        }
    };

    let breaker = {
        // The service timeout bounds each proxied call
        let mut breaker_config = service.breaker_config.clone();
        breaker_config.call_timeout = service.timeout;
        state.breakers.get_or_create(&service.name, &breaker_config)
    };

    let attempts = service.retries + 1;
    let mut last_error = GatewayError::NoHealthyInstance {
        service: service.name.clone(),
    };

    for attempt in 0..attempts {
        // Fail fast before any per-call work: an open breaker must not
        // select an instance, advance balancer counters, or touch
        // connection accounting.
        if !breaker.can_execute() {
            let err = GatewayError::CircuitOpen {
                service: service.name.clone(),
            };
            return finish_error(&service.name, &method, err, started);
        }

        let instance = match state.balancer.select_instance(&service, client_ip) {
            Some(instance) => instance,
            None => {
                let err = GatewayError::NoHealthyInstance {
                    service: service.name.clone(),
                };
                return finish_error(&service.name, &method, err, started);
            }
        };

        let guard = ConnectionGuard::acquire(instance.clone());
        observability::connection_opened(&service.name);
        let outcome = breaker
            .run(forward(
                &state.client,
                &service,
                guard.instance(),
                &method,
                &path,
                query.as_deref(),
                &headers,
                body.clone(),
                client_ip,
            ))
            .await;
        drop(guard);
        observability::connection_closed(&service.name);

        match outcome {
            Ok(upstream) => {
                observability::record_request(
                    &service.name,
                    &method,
                    upstream.status,
                    started.elapsed(),
                );
                let mut response = into_response(upstream);
                if let Some(decision) = &quota {
                    apply_quota_headers(&mut response, decision);
                }
                return response;
            }
            // Connection errors may hit another instance; anything else is final
            Err(err @ GatewayError::UpstreamConnection { .. }) if attempt + 1 < attempts => {
                warn!(
                    service = %service.name,
                    instance = %instance.id,
                    attempt = attempt + 1,
                    error = %err,
                    "upstream attempt failed, retrying"
                );
                last_error = err;
            }
            Err(err) => return finish_error(&service.name, &method, err, started),
        }
    }

    finish_error(&service.name, &method, last_error, started)
}

/// Send one buffered request to one backend instance
async fn forward(
    client: &reqwest::Client,
    service: &Service,
    instance: &Arc<ServiceInstance>,
    method: &str,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
    client_ip: Option<IpAddr>,
) -> Result<UpstreamResponse, GatewayError> {
    let rest = path.strip_prefix(&service.path_prefix).unwrap_or(path);
    let rest = if rest.is_empty() { "/" } else { rest };
    let mut url = format!("{}{}", instance.url(), rest);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }

    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| GatewayError::internal(format!("invalid method: {}", method)))?;

    debug!(service = %service.name, instance = %instance.id, %url, "forwarding request");

    let response = client
        .request(method, &url)
        .headers(forward_headers(headers, client_ip))
        .body(body)
        .send()
        .await
        .map_err(|e| GatewayError::from_upstream(&service.name, e, service.timeout))?;

    let status = response.status().as_u16();
    let response_headers = response.headers().clone();
    let body = response
        .bytes()
        .await
        .map_err(|e| GatewayError::from_upstream(&service.name, e, service.timeout))?;

    Ok(UpstreamResponse {
        status,
        headers: response_headers,
        body,
    })
}

/// Copy request headers across http versions, dropping hop-by-hop ones and
/// stamping the forwarding headers.
fn forward_headers(headers: &HeaderMap, client_ip: Option<IpAddr>) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();

    for (name, value) in headers {
        let name_str = name.as_str();
        if HOP_BY_HOP.contains(&name_str) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name_str.as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }

    if let Some(ip) = client_ip {
        let forwarded = match headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{}, {}", existing, ip),
            None => ip.to_string(),
        };
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&forwarded) {
            out.insert("x-forwarded-for", value);
        }
    }
    if let Ok(value) = reqwest::header::HeaderValue::from_str("http") {
        out.insert("x-forwarded-proto", value);
    }
    if let Some(host) = headers.get("host").and_then(|v| v.to_str().ok()) {
        if let Ok(value) = reqwest::header::HeaderValue::from_str(host) {
            out.insert("x-forwarded-host", value);
        }
    }

    out
}

/// Convert the buffered backend reply into an axum response
fn into_response(upstream: UpstreamResponse) -> Response {
    let status =
        StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    for (name, value) in &upstream.headers {
        let name_str = name.as_str();
        if RESPONSE_SKIP.contains(&name_str) {
            continue;
        }
        builder = builder.header(name_str, value.as_bytes());
    }

    builder
        .body(axum::body::Body::from(upstream.body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Identifier the quota applies to, per the rule's key type
fn quota_identifier(
    key: &RateLimitKey,
    client_ip: Option<IpAddr>,
    headers: &HeaderMap,
    auth: Option<&crate::auth::AuthContext>,
) -> String {
    match key {
        RateLimitKey::Ip => client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        RateLimitKey::User => auth
            .map(|a| a.user_id.clone())
            .unwrap_or_else(|| "anonymous".to_string()),
        RateLimitKey::ApiKey => headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(|k| k.to_string())
            .unwrap_or_else(|| "missing".to_string()),
    }
}

/// Stamp the standard quota headers onto a response
fn apply_quota_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    if let Ok(value) = decision.limit.to_string().parse() {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = decision.remaining.to_string().parse() {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Ok(value) = decision.reset_at.to_string().parse() {
        headers.insert("x-ratelimit-reset", value);
    }
}

/// Best-effort client address: trust X-Forwarded-For first, then the socket
fn client_ip(req: &Request) -> Option<IpAddr> {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return Some(ip);
            }
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

/// Record metrics for a failed request and convert it to a response
fn finish_error(service: &str, method: &str, err: GatewayError, started: Instant) -> Response {
    match &err {
        GatewayError::CircuitOpen { .. } => observability::record_breaker_rejection(service),
        GatewayError::UpstreamTimeout { .. }
        | GatewayError::UpstreamConnection { .. }
        | GatewayError::NoHealthyInstance { .. } => {
            observability::record_upstream_error(service, err.error_type())
        }
        _ => {}
    }
    observability::record_request(service, method, err.status_code().as_u16(), started.elapsed());
    err.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use std::time::Duration;

    fn request_with_headers(pairs: &[(&str, &str)]) -> Request {
        let mut builder = axum::http::Request::builder().uri("/api/users");
        for (name, value) in pairs {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let req = request_with_headers(&[("x-forwarded-for", "203.0.113.9, 10.0.0.1")]);
        assert_eq!(client_ip(&req), Some("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_client_ip_falls_back_to_socket() {
        let mut req = request_with_headers(&[]);
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("198.51.100.4:4711".parse().unwrap()));
        assert_eq!(client_ip(&req), Some("198.51.100.4".parse().unwrap()));
    }

    #[test]
    fn test_client_ip_none_when_unknown() {
        let req = request_with_headers(&[("x-forwarded-for", "not-an-ip")]);
        assert_eq!(client_ip(&req), None);
    }

    #[test]
    fn test_forward_headers_strips_hop_by_hop_and_stamps_forwarding() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "gateway.example".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("x-custom", "kept".parse().unwrap());

        let out = forward_headers(&headers, Some("203.0.113.9".parse().unwrap()));

        assert!(out.get("host").is_none());
        assert!(out.get("connection").is_none());
        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert_eq!(out.get("x-custom").unwrap(), "kept");
        assert_eq!(out.get("x-forwarded-for").unwrap(), "203.0.113.9");
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(out.get("x-forwarded-host").unwrap(), "gateway.example");
    }

    #[test]
    fn test_forward_headers_appends_to_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "198.51.100.7".parse().unwrap());

        let out = forward_headers(&headers, Some("203.0.113.9".parse().unwrap()));
        assert_eq!(
            out.get("x-forwarded-for").unwrap(),
            "198.51.100.7, 203.0.113.9"
        );
    }

    #[test]
    fn test_quota_identifier_selection() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "key-1".parse().unwrap());
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let auth = crate::auth::AuthContext {
            user_id: "alice".to_string(),
            roles: vec![],
            method: "api_key",
        };

        assert_eq!(
            quota_identifier(&RateLimitKey::Ip, Some(ip), &headers, None),
            "203.0.113.9"
        );
        assert_eq!(
            quota_identifier(&RateLimitKey::Ip, None, &headers, None),
            "unknown"
        );
        assert_eq!(
            quota_identifier(&RateLimitKey::User, None, &headers, Some(&auth)),
            "alice"
        );
        assert_eq!(
            quota_identifier(&RateLimitKey::User, None, &headers, None),
            "anonymous"
        );
        assert_eq!(
            quota_identifier(&RateLimitKey::ApiKey, None, &headers, None),
            "key-1"
        );
    }

    #[test]
    fn test_quota_headers_applied() {
        let mut response = StatusCode::OK.into_response();
        apply_quota_headers(
            &mut response,
            &RateLimitDecision {
                allowed: true,
                limit: 100,
                remaining: 42,
                reset_at: 1_700_000_000,
                window: Duration::from_secs(60),
            },
        );

        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "100");
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "42");
        assert_eq!(
            response.headers().get("x-ratelimit-reset").unwrap(),
            "1700000000"
        );
    }
}
