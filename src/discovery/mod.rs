//! # Service Discovery Module
//!
//! Keeps each service's instance list in sync with an external registry.
//! The reconciler diffs the discovered set against the registry on every
//! tick and applies only the difference, so instances that are still
//! present keep their runtime state (health flag, connection counts,
//! latency average).
//!
//! A discovery outage must never take down a working gateway: when a
//! backend lookup fails the reconciler logs and keeps the current instance
//! list untouched.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::DiscoveryConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{ServiceInstance, ServiceRegistry};

/// One instance as reported by a discovery backend
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredInstance {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub metadata: HashMap<String, String>,
}

impl DiscoveredInstance {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            weight: 1,
            metadata: HashMap::new(),
        }
    }

    fn into_instance(self) -> Arc<ServiceInstance> {
        Arc::new(
            ServiceInstance::new(self.id, self.host, self.port, self.weight)
                .with_metadata(self.metadata),
        )
    }
}

/// Pluggable registry backend
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Announce an instance to the registry
    async fn register(&self, service: &str, instance: DiscoveredInstance) -> GatewayResult<()>;

    /// List the instances currently registered for a service
    async fn discover(&self, service: &str) -> GatewayResult<Vec<DiscoveredInstance>>;

    /// Remove an instance from the registry
    async fn deregister(&self, service: &str, instance_id: &str) -> GatewayResult<()>;
}

/// Build the backend selected by configuration
pub fn backend_from_config(config: &DiscoveryConfig) -> GatewayResult<Arc<dyn DiscoveryBackend>> {
    use crate::core::config::DiscoveryKind;
    match config.kind {
        DiscoveryKind::Static => Ok(Arc::new(StaticBackend::new())),
        DiscoveryKind::Http => Ok(Arc::new(HttpRegistryBackend::new(&format!(
            "http://{}:{}",
            config.host, config.port
        ))?)),
    }
}

/// In-process registry, used for static deployments and tests
#[derive(Default)]
pub struct StaticBackend {
    entries: DashMap<String, Vec<DiscoveredInstance>>,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl DiscoveryBackend for StaticBackend {
    async fn register(&self, service: &str, instance: DiscoveredInstance) -> GatewayResult<()> {
        let mut entry = self.entries.entry(service.to_string()).or_default();
        entry.retain(|i| i.id != instance.id);
        entry.push(instance);
        Ok(())
    }

    async fn discover(&self, service: &str) -> GatewayResult<Vec<DiscoveredInstance>> {
        Ok(self
            .entries
            .get(service)
            .map(|e| e.clone())
            .unwrap_or_default())
    }

    async fn deregister(&self, service: &str, instance_id: &str) -> GatewayResult<()> {
        if let Some(mut entry) = self.entries.get_mut(service) {
            entry.retain(|i| i.id != instance_id);
        }
        Ok(())
    }
}

/// Consul-compatible HTTP catalog backend
pub struct HttpRegistryBackend {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterPayload<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    meta: &'a HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "Service")]
    service: CatalogService,
}

#[derive(Debug, Deserialize)]
struct CatalogService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
}

impl HttpRegistryBackend {
    pub fn new(base_url: &str) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::discovery(format!("discovery client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl DiscoveryBackend for HttpRegistryBackend {
    async fn register(&self, service: &str, instance: DiscoveredInstance) -> GatewayResult<()> {
        let payload = RegisterPayload {
            id: &instance.id,
            name: service,
            address: &instance.host,
            port: instance.port,
            meta: &instance.metadata,
        };

        let response = self
            .client
            .put(format!("{}/v1/agent/service/register", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| GatewayError::discovery(format!("register failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::discovery(format!(
                "register returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn discover(&self, service: &str) -> GatewayResult<Vec<DiscoveredInstance>> {
        let response = self
            .client
            .get(format!(
                "{}/v1/health/service/{}?passing=true",
                self.base_url, service
            ))
            .send()
            .await
            .map_err(|e| GatewayError::discovery(format!("discover failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::discovery(format!(
                "discover returned {}",
                response.status()
            )));
        }

        let entries: Vec<CatalogEntry> = response
            .json()
            .await
            .map_err(|e| GatewayError::discovery(format!("invalid catalog response: {}", e)))?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let weight = entry
                    .service
                    .meta
                    .get("weight")
                    .and_then(|w| w.parse().ok())
                    .unwrap_or(1);
                DiscoveredInstance {
                    id: entry.service.id,
                    host: entry.service.address,
                    port: entry.service.port,
                    weight,
                    metadata: entry.service.meta,
                }
            })
            .collect())
    }

    async fn deregister(&self, service: &str, instance_id: &str) -> GatewayResult<()> {
        let response = self
            .client
            .put(format!(
                "{}/v1/agent/service/deregister/{}",
                self.base_url, instance_id
            ))
            .send()
            .await
            .map_err(|e| GatewayError::discovery(format!("deregister failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::discovery(format!(
                "deregister of {} returned {}",
                service,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Periodic reconciliation between the discovery backend and the registry
pub struct Reconciler {
    registry: Arc<ServiceRegistry>,
    backend: Arc<dyn DiscoveryBackend>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        backend: Arc<dyn DiscoveryBackend>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            backend,
            interval,
        }
    }

    /// Run reconciliation ticks until the token is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "discovery reconciler started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.reconcile_all().await,
                _ = shutdown.cancelled() => {
                    info!("discovery reconciler stopped");
                    return;
                }
            }
        }
    }

    /// Reconcile every registered service once
    pub async fn reconcile_all(&self) {
        for service in self.registry.all() {
            if let Err(err) = self.reconcile_service(&service.name).await {
                // Keep serving with the last known instance set
                warn!(
                    service = %service.name,
                    error = %err,
                    "discovery lookup failed, keeping current instances"
                );
            }
        }
    }

    /// Diff the discovered set against the current one and apply the changes
    pub async fn reconcile_service(&self, service_name: &str) -> GatewayResult<()> {
        let service = self
            .registry
            .get(service_name)
            .ok_or_else(|| GatewayError::discovery(format!("unknown service {}", service_name)))?;

        let discovered = self.backend.discover(service_name).await?;
        let current_ids = service.instance_ids();
        let discovered_ids: std::collections::HashSet<String> =
            discovered.iter().map(|i| i.id.clone()).collect();

        let mut added = 0usize;
        for instance in discovered {
            if !current_ids.contains(&instance.id) {
                debug!(service = service_name, instance = %instance.id, "instance discovered");
                service.add_instance(instance.into_instance());
                added += 1;
            }
        }

        let mut removed = 0usize;
        for id in current_ids.difference(&discovered_ids) {
            debug!(service = service_name, instance = %id, "instance deregistered");
            service.remove_instance(id);
            removed += 1;
        }

        if added > 0 || removed > 0 {
            info!(
                service = service_name,
                added, removed, "instance set reconciled"
            );
        }
        Ok(())
    }
}
