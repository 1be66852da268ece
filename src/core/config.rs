//! # Configuration Module
//!
//! YAML configuration loading for the gateway: bind address, authentication,
//! CORS, service discovery, and the per-service routing/resilience settings.
//!
//! Configuration is loaded once at startup. Services are statically
//! configured and never removed at runtime; only their instance lists change
//! (through discovery and health checking). Environment variables of the form
//! `GATEWAY_<FIELD>` override the file for the most operationally relevant
//! knobs.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::Strategy;

use crate::core::circuit_breaker::CircuitBreakerConfig;

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared store for distributed rate limiting; in-memory when unset
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default)]
    pub authentication: AuthConfig,

    #[serde(default)]
    pub cors: CorsConfig,

    #[serde(default)]
    pub service_discovery: DiscoveryConfig,

    /// Global health-check tick; one tick probes every instance of every service
    #[serde(with = "humantime_serde", default = "default_health_interval")]
    pub health_check_interval: Duration,

    /// Discovery reconciliation tick
    #[serde(with = "humantime_serde", default = "default_discovery_interval")]
    pub discovery_interval: Duration,

    pub services: Vec<ServiceConfig>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_discovery_interval() -> Duration {
    Duration::from_secs(60)
}

impl GatewayConfig {
    /// Load and validate configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            GatewayError::config(format!(
                "failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        let mut config: GatewayConfig = serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("failed to parse config: {}", e)))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GATEWAY_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(host) = env::var("GATEWAY_HOST") {
            self.host = host;
        }

        if let Ok(port) = env::var("GATEWAY_PORT") {
            self.port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("invalid GATEWAY_PORT: {}", e)))?;
        }

        if let Ok(url) = env::var("GATEWAY_REDIS_URL") {
            self.redis_url = Some(url);
        }

        if let Ok(interval) = env::var("GATEWAY_HEALTH_CHECK_INTERVAL") {
            self.health_check_interval = humantime::parse_duration(&interval).map_err(|e| {
                GatewayError::config(format!("invalid GATEWAY_HEALTH_CHECK_INTERVAL: {}", e))
            })?;
        }

        if let Ok(interval) = env::var("GATEWAY_DISCOVERY_INTERVAL") {
            self.discovery_interval = humantime::parse_duration(&interval).map_err(|e| {
                GatewayError::config(format!("invalid GATEWAY_DISCOVERY_INTERVAL: {}", e))
            })?;
        }

        Ok(())
    }

    /// Validate the whole configuration, collecting every problem found
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.host.is_empty() {
            errors.push("host cannot be empty".to_string());
        }
        if self.port == 0 {
            errors.push("port must be non-zero".to_string());
        }

        if self.cors.allow_credentials && self.cors.allow_origins.iter().any(|o| o == "*") {
            errors.push("cors: allow_credentials cannot be combined with wildcard origin".into());
        }

        let mut names = HashSet::new();
        let mut prefixes = HashSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                errors.push("service name cannot be empty".to_string());
            } else if !names.insert(service.name.clone()) {
                errors.push(format!("duplicate service name: {}", service.name));
            }

            if service.path_prefix.is_empty() || !service.path_prefix.starts_with('/') {
                errors.push(format!(
                    "service '{}': path_prefix must be non-empty and start with '/'",
                    service.name
                ));
            } else if !prefixes.insert(service.path_prefix.clone()) {
                errors.push(format!(
                    "service '{}': duplicate path_prefix {}",
                    service.name, service.path_prefix
                ));
            }

            if service.timeout.is_zero() {
                errors.push(format!("service '{}': timeout must be non-zero", service.name));
            }

            if let Some(rule) = &service.rate_limit {
                if rule.limit == 0 {
                    errors.push(format!(
                        "service '{}': rate_limit.limit must be greater than 0",
                        service.name
                    ));
                }
                if rule.window.is_zero() {
                    errors.push(format!(
                        "service '{}': rate_limit.window must be non-zero",
                        service.name
                    ));
                }
            }

            if service.circuit_breaker.failure_threshold == 0 {
                errors.push(format!(
                    "service '{}': circuit_breaker.failure_threshold must be greater than 0",
                    service.name
                ));
            }
            if service.circuit_breaker.success_threshold == 0 {
                errors.push(format!(
                    "service '{}': circuit_breaker.success_threshold must be greater than 0",
                    service.name
                ));
            }

            let mut instance_ids = HashSet::new();
            for instance in &service.instances {
                if instance.id.is_empty() {
                    errors.push(format!("service '{}': instance id cannot be empty", service.name));
                } else if !instance_ids.insert(instance.id.clone()) {
                    errors.push(format!(
                        "service '{}': duplicate instance id {}",
                        service.name, instance.id
                    ));
                }
                if instance.host.is_empty() {
                    errors.push(format!(
                        "service '{}': instance '{}' host cannot be empty",
                        service.name, instance.id
                    ));
                }
                if instance.port == 0 {
                    errors.push(format!(
                        "service '{}': instance '{}' port must be non-zero",
                        service.name, instance.id
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(errors.join("; ")))
        }
    }
}

/// Per-service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub path_prefix: String,

    #[serde(default)]
    pub load_balancing_strategy: Strategy,

    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,

    #[serde(with = "humantime_serde", default = "default_health_interval")]
    pub health_check_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,

    /// Extra proxy attempts after a connection-level failure
    #[serde(default)]
    pub retries: u32,

    #[serde(default)]
    pub authentication_required: bool,

    /// Allowed HTTP methods; empty means all methods
    #[serde(default)]
    pub allowed_methods: Vec<String>,

    #[serde(default)]
    pub rate_limit: Option<RateLimitRule>,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            path_prefix: String::new(),
            load_balancing_strategy: Strategy::default(),
            health_check_path: default_health_check_path(),
            health_check_interval: default_health_interval(),
            timeout: default_timeout(),
            retries: 0,
            authentication_required: false,
            allowed_methods: Vec::new(),
            rate_limit: None,
            circuit_breaker: CircuitBreakerConfig::default(),
            instances: Vec::new(),
        }
    }
}

/// Statically configured backend instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Which request attribute identifies a caller for rate limiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    Ip,
    User,
    ApiKey,
}

impl RateLimitKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::User => "user",
            Self::ApiKey => "api_key",
        }
    }
}

/// Sliding-window rate limit rule for one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Maximum requests allowed inside the window
    pub limit: u32,
    /// Trailing window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Identifier the limit applies to
    #[serde(default = "default_rate_limit_key")]
    pub key: RateLimitKey,
}

fn default_rate_limit_key() -> RateLimitKey {
    RateLimitKey::Ip
}

/// Authentication collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// "api_key", "jwt", or "none"
    #[serde(default = "default_auth_method")]
    pub method: String,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_jwt_algorithm")]
    pub jwt_algorithm: String,
    #[serde(default)]
    pub api_keys: HashMap<String, ApiKeyEntry>,
}

fn default_auth_method() -> String {
    "none".to_string()
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: default_auth_method(),
            jwt_secret: None,
            jwt_algorithm: default_jwt_algorithm(),
            api_keys: HashMap::new(),
        }
    }
}

/// One configured API key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn default_true() -> bool {
    true
}

/// CORS policy applied to the gateway surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_wildcard")]
    pub allow_origins: Vec<String>,
    #[serde(default = "default_cors_methods")]
    pub allow_methods: Vec<String>,
    #[serde(default = "default_wildcard")]
    pub allow_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
}

fn default_wildcard() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_cors_methods() -> Vec<String> {
    vec![
        "GET".to_string(),
        "POST".to_string(),
        "PUT".to_string(),
        "DELETE".to_string(),
        "PATCH".to_string(),
        "OPTIONS".to_string(),
    ]
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: default_wildcard(),
            allow_methods: default_cors_methods(),
            allow_headers: default_wildcard(),
            allow_credentials: false,
        }
    }
}

/// Service discovery backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(rename = "type", default)]
    pub kind: DiscoveryKind,
    #[serde(default = "default_discovery_host")]
    pub host: String,
    #[serde(default = "default_discovery_port")]
    pub port: u16,
}

fn default_discovery_host() -> String {
    "127.0.0.1".to_string()
}

fn default_discovery_port() -> u16 {
    8500
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            kind: DiscoveryKind::Static,
            host: default_discovery_host(),
            port: default_discovery_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    /// Instances come from configuration only
    #[default]
    Static,
    /// Consul-style HTTP catalog
    Http,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
host: 127.0.0.1
port: 8080
services:
  - name: users
    path_prefix: /api/users
    load_balancing_strategy: weighted_round_robin
    health_check_path: /healthz
    health_check_interval: 10s
    timeout: 5s
    retries: 2
    authentication_required: true
    allowed_methods: [GET, POST]
    rate_limit:
      limit: 100
      window: 60s
      key: ip
    circuit_breaker:
      failure_threshold: 3
      recovery_timeout: 30s
      success_threshold: 2
    instances:
      - id: users-1
        host: 10.0.0.1
        port: 9001
        weight: 3
      - id: users-2
        host: 10.0.0.2
        port: 9001
"#;

    #[test]
    fn test_parse_full_service_config() {
        let config = GatewayConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.services.len(), 1);

        let service = &config.services[0];
        assert_eq!(service.name, "users");
        assert_eq!(service.path_prefix, "/api/users");
        assert_eq!(service.load_balancing_strategy, Strategy::WeightedRoundRobin);
        assert_eq!(service.timeout, Duration::from_secs(5));
        assert_eq!(service.retries, 2);
        assert!(service.authentication_required);

        let rule = service.rate_limit.as_ref().unwrap();
        assert_eq!(rule.limit, 100);
        assert_eq!(rule.window, Duration::from_secs(60));
        assert_eq!(rule.key, RateLimitKey::Ip);

        assert_eq!(service.circuit_breaker.failure_threshold, 3);
        assert_eq!(service.circuit_breaker.recovery_timeout, Duration::from_secs(30));

        assert_eq!(service.instances.len(), 2);
        assert_eq!(service.instances[0].weight, 3);
        assert_eq!(service.instances[1].weight, 1); // default
    }

    #[test]
    fn test_defaults_applied() {
        let config = GatewayConfig::from_yaml(
            "services:\n  - name: a\n    path_prefix: /a\n",
        )
        .unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.discovery_interval, Duration::from_secs(60));
        assert_eq!(config.services[0].health_check_path, "/health");
        assert_eq!(config.services[0].load_balancing_strategy, Strategy::RoundRobin);
        assert_eq!(config.service_discovery.kind, DiscoveryKind::Static);
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let yaml = r#"
services:
  - name: a
    path_prefix: /api
  - name: b
    path_prefix: /api
"#;
        let err = GatewayConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate path_prefix"));
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let yaml = "services:\n  - name: a\n    path_prefix: api\n";
        let err = GatewayConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("start with '/'"));
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let yaml = r#"
services:
  - name: a
    path_prefix: /a
    rate_limit:
      limit: 0
      window: 60s
"#;
        let err = GatewayConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("rate_limit.limit"));
    }

    #[test]
    fn test_credentials_with_wildcard_origin_rejected() {
        let yaml = r#"
cors:
  allow_credentials: true
services:
  - name: a
    path_prefix: /a
"#;
        let err = GatewayConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("allow_credentials"));
    }
}
