//! # Core Types Module
//!
//! Foundational data structures shared by every gateway component: backend
//! instances, services, and the service registry the dispatcher routes
//! against.
//!
//! ## Concurrency discipline
//!
//! The registry is read on every request and written only by the two
//! background loops (health checking, discovery reconciliation). Instance
//! lists are therefore kept behind a `parking_lot::RwLock` and handed out as
//! cloned `Vec<Arc<ServiceInstance>>` snapshots, so readers never observe a
//! partially-updated list. Per-instance runtime state (`healthy`,
//! `connections`, `response_time`) uses atomics so the hot path never takes
//! a lock for it.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::circuit_breaker::CircuitBreakerConfig;
use crate::core::config::{RateLimitRule, ServiceConfig};
use crate::load_balancing::Strategy;

/// Smoothing factor for the exponentially-weighted response time average
const RESPONSE_TIME_ALPHA: f64 = 0.3;

/// One backend process of a service
///
/// Identity fields (`id`, `host`, `port`, `weight`) are immutable after
/// creation. Runtime state is mutated concurrently: `healthy`,
/// `response_time` and `last_health_check` only by the health checker,
/// `connections` only by the dispatcher through [`ConnectionGuard`].
#[derive(Debug)]
pub struct ServiceInstance {
    /// Unique instance identifier within its service
    pub id: String,
    /// Backend host name or address
    pub host: String,
    /// Backend port
    pub port: u16,
    /// Load balancing weight, always >= 1
    pub weight: u32,
    /// Free-form instance metadata from discovery
    pub metadata: HashMap<String, String>,

    healthy: AtomicBool,
    connections: AtomicUsize,
    /// EWMA latency in seconds, stored as f64 bits
    response_time: AtomicU64,
    last_health_check: Mutex<Option<Instant>>,
}

impl ServiceInstance {
    /// Create a new instance; weights below 1 are clamped to 1.
    ///
    /// Instances start healthy so they can serve traffic immediately; the
    /// health checker corrects the flag on its next tick.
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        weight: u32,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            weight: weight.max(1),
            metadata: HashMap::new(),
            healthy: AtomicBool::new(true),
            connections: AtomicUsize::new(0),
            response_time: AtomicU64::new(0f64.to_bits()),
            last_health_check: Mutex::new(None),
        }
    }

    /// Attach discovery metadata
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Base URL for proxying and health probes
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    /// Current in-flight request count
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// EWMA response time in seconds
    pub fn response_time(&self) -> f64 {
        f64::from_bits(self.response_time.load(Ordering::Acquire))
    }

    /// Fold a measured round-trip into the running average
    pub fn observe_response_time(&self, rtt: Duration) {
        let sample = rtt.as_secs_f64();
        let current = self.response_time();
        let next = if current == 0.0 {
            sample
        } else {
            current * (1.0 - RESPONSE_TIME_ALPHA) + sample * RESPONSE_TIME_ALPHA
        };
        self.response_time.store(next.to_bits(), Ordering::Release);
    }

    /// Stamp the time of the most recent health probe
    pub fn mark_checked(&self) {
        *self.last_health_check.lock() = Some(Instant::now());
    }

    pub fn last_health_check(&self) -> Option<Instant> {
        *self.last_health_check.lock()
    }
}

/// Scoped in-flight connection accounting
///
/// Increments the instance's connection count on acquisition and decrements
/// it exactly once when dropped, on every exit path (success, error, timeout
/// cancellation). The decrement saturates at zero.
pub struct ConnectionGuard {
    instance: Arc<ServiceInstance>,
}

impl ConnectionGuard {
    pub fn acquire(instance: Arc<ServiceInstance>) -> Self {
        instance.connections.fetch_add(1, Ordering::AcqRel);
        Self { instance }
    }

    pub fn instance(&self) -> &Arc<ServiceInstance> {
        &self.instance
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let _ = self
            .instance
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }
}

/// A named collection of instances behind one logical backend
///
/// Created once at startup from configuration and never removed while the
/// gateway runs; only the instance list changes afterwards.
#[derive(Debug)]
pub struct Service {
    pub name: String,
    pub path_prefix: String,
    pub strategy: Strategy,
    pub health_check_path: String,
    pub health_check_interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub rate_limit: Option<RateLimitRule>,
    pub authentication_required: bool,
    /// Allowed HTTP methods, uppercase; empty set allows all methods
    pub allowed_methods: HashSet<String>,
    pub breaker_config: CircuitBreakerConfig,

    instances: RwLock<Vec<Arc<ServiceInstance>>>,
}

impl Service {
    /// Build a service and its initial instance set from configuration
    pub fn from_config(config: &ServiceConfig) -> Self {
        let instances = config
            .instances
            .iter()
            .map(|i| Arc::new(ServiceInstance::new(&i.id, &i.host, i.port, i.weight)))
            .collect();

        Self {
            name: config.name.clone(),
            path_prefix: config.path_prefix.clone(),
            strategy: config.load_balancing_strategy,
            health_check_path: config.health_check_path.clone(),
            health_check_interval: config.health_check_interval,
            timeout: config.timeout,
            retries: config.retries,
            rate_limit: config.rate_limit.clone(),
            authentication_required: config.authentication_required,
            allowed_methods: config
                .allowed_methods
                .iter()
                .map(|m| m.to_uppercase())
                .collect(),
            breaker_config: config.circuit_breaker.clone(),
            instances: RwLock::new(instances),
        }
    }

    /// Snapshot of all instances (healthy or not)
    pub fn instances(&self) -> Vec<Arc<ServiceInstance>> {
        self.instances.read().clone()
    }

    /// Snapshot of instances currently marked healthy, in list order
    pub fn healthy_instances(&self) -> Vec<Arc<ServiceInstance>> {
        self.instances
            .read()
            .iter()
            .filter(|i| i.is_healthy())
            .cloned()
            .collect()
    }

    /// IDs of all registered instances
    pub fn instance_ids(&self) -> HashSet<String> {
        self.instances.read().iter().map(|i| i.id.clone()).collect()
    }

    /// Register a newly discovered instance; no-op if the id already exists
    pub fn add_instance(&self, instance: Arc<ServiceInstance>) {
        let mut guard = self.instances.write();
        if !guard.iter().any(|i| i.id == instance.id) {
            guard.push(instance);
        }
    }

    /// Drop an instance no longer reported by discovery
    pub fn remove_instance(&self, instance_id: &str) -> bool {
        let mut guard = self.instances.write();
        let before = guard.len();
        guard.retain(|i| i.id != instance_id);
        guard.len() != before
    }

    /// Whether this service accepts the given HTTP method
    pub fn allows_method(&self, method: &str) -> bool {
        self.allowed_methods.is_empty()
            || self.allowed_methods.contains(&method.to_uppercase())
    }
}

/// Process-wide service registry, injected into every component that needs it
///
/// Maps service name to service and resolves request paths with
/// longest-prefix matching.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Build the registry from startup configuration
    pub fn from_configs(configs: &[ServiceConfig]) -> Self {
        let registry = Self::new();
        for config in configs {
            registry.insert(Arc::new(Service::from_config(config)));
        }
        registry
    }

    pub fn insert(&self, service: Arc<Service>) {
        self.services.insert(service.name.clone(), service);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).map(|s| s.clone())
    }

    pub fn all(&self) -> Vec<Arc<Service>> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Resolve a request path to a service, longest path_prefix wins
    pub fn match_path(&self, path: &str) -> Option<Arc<Service>> {
        let mut best: Option<Arc<Service>> = None;
        for entry in self.services.iter() {
            let service = entry.value();
            if path.starts_with(&service.path_prefix) {
                match &best {
                    Some(current) if current.path_prefix.len() >= service.path_prefix.len() => {}
                    _ => best = Some(service.clone()),
                }
            }
        }
        best
    }
}
