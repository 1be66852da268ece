//! # Authentication Module
//!
//! Credential validation for services that require it. Two schemes are
//! supported, checked in order: an `X-Api-Key` header looked up against the
//! configured key table, then a `Bearer` JWT validated with the configured
//! secret. A service with `authentication_required: false` skips this module
//! entirely.

use axum::http::HeaderMap;
use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

use crate::core::config::AuthConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Identity attached to a request after successful authentication
#[derive(Debug, Clone, Serialize)]
pub struct AuthContext {
    pub user_id: String,
    pub roles: Vec<String>,
    /// Which scheme authenticated the request: "api_key" or "jwt"
    pub method: &'static str,
}

/// JWT claims the gateway understands
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: u64,
}

/// Validates request credentials against the configured scheme
pub struct Authenticator {
    config: AuthConfig,
    decoding_key: Option<DecodingKey>,
    validation: Validation,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> GatewayResult<Self> {
        let algorithm = Algorithm::from_str(&config.jwt_algorithm).map_err(|_| {
            GatewayError::config(format!("unknown jwt algorithm: {}", config.jwt_algorithm))
        })?;

        if config.method == "jwt" && config.jwt_secret.is_none() {
            return Err(GatewayError::config(
                "authentication method is jwt but jwt_secret is not set",
            ));
        }

        let decoding_key = config
            .jwt_secret
            .as_ref()
            .map(|secret| DecodingKey::from_secret(secret.as_bytes()));

        Ok(Self {
            config,
            decoding_key,
            validation: Validation::new(algorithm),
        })
    }

    /// Whether any scheme is configured at all
    pub fn enabled(&self) -> bool {
        self.config.method != "none"
    }

    /// Authenticate a request from its headers
    ///
    /// API keys win over bearer tokens when both are present.
    pub fn authenticate(&self, headers: &HeaderMap) -> GatewayResult<AuthContext> {
        if !self.enabled() {
            return Ok(AuthContext {
                user_id: "anonymous".to_string(),
                roles: Vec::new(),
                method: "none",
            });
        }

        if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
            return self.check_api_key(key);
        }

        if let Some(token) = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            return self.check_jwt(token);
        }

        Err(GatewayError::auth("missing credentials"))
    }

    fn check_api_key(&self, key: &str) -> GatewayResult<AuthContext> {
        let entry = self
            .config
            .api_keys
            .get(key)
            .ok_or_else(|| GatewayError::auth("unknown api key"))?;

        if !entry.active {
            return Err(GatewayError::auth("api key is disabled"));
        }
        if let Some(expires_at) = entry.expires_at {
            if expires_at <= Utc::now() {
                return Err(GatewayError::auth("api key has expired"));
            }
        }

        debug!(user_id = %entry.user_id, "authenticated via api key");
        Ok(AuthContext {
            user_id: entry.user_id.clone(),
            roles: entry.roles.clone(),
            method: "api_key",
        })
    }

    fn check_jwt(&self, token: &str) -> GatewayResult<AuthContext> {
        let key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| GatewayError::auth("jwt authentication is not configured"))?;

        let data = decode::<Claims>(token, key, &self.validation)
            .map_err(|e| GatewayError::auth(format!("invalid token: {}", e)))?;

        debug!(user_id = %data.claims.sub, "authenticated via jwt");
        Ok(AuthContext {
            user_id: data.claims.sub,
            roles: data.claims.roles,
            method: "jwt",
        })
    }
}
