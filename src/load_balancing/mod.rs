//! # Load Balancing Module
//!
//! Picks one healthy backend instance for a service according to its
//! configured strategy. Strategies are a plain enum with one exhaustive
//! match: every algorithm is a pure function of the healthy instance list
//! plus a small piece of counter state, which fits a sum type better than
//! trait objects.
//!
//! Round-robin counters are owned by the balancer and keyed by service name
//! (an arena pattern), so immutable service configuration never carries
//! mutable selection state. Counters are shared across all callers of a
//! service and persist for the life of the gateway process.

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::core::types::{Service, ServiceInstance};

/// Relative weight of in-flight connections in the health_based score
const HEALTH_SCORE_CONNECTION_WEIGHT: f64 = 0.1;

/// Load balancing strategy for one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
    IpHash,
    Random,
    HealthBased,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::LeastConnections => "least_connections",
            Self::LeastResponseTime => "least_response_time",
            Self::IpHash => "ip_hash",
            Self::Random => "random",
            Self::HealthBased => "health_based",
        }
    }
}

/// Instance selector with per-service counter state
#[derive(Default)]
pub struct LoadBalancer {
    counters: DashMap<String, AtomicUsize>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Select a healthy instance for the service, or `None` when the
    /// healthy set is empty. Never returns an unhealthy instance.
    pub fn select_instance(
        &self,
        service: &Service,
        client_ip: Option<IpAddr>,
    ) -> Option<Arc<ServiceInstance>> {
        let healthy = service.healthy_instances();
        if healthy.is_empty() {
            return None;
        }

        let selected = match service.strategy {
            Strategy::RoundRobin => {
                let index = self.next_position(&service.name) % healthy.len();
                healthy[index].clone()
            }
            Strategy::WeightedRoundRobin => {
                let total: usize = healthy.iter().map(|i| i.weight as usize).sum();
                let position = self.next_position(&service.name) % total;
                let mut acc = 0usize;
                let mut chosen = healthy[0].clone();
                for instance in &healthy {
                    acc += instance.weight as usize;
                    if position < acc {
                        chosen = instance.clone();
                        break;
                    }
                }
                chosen
            }
            Strategy::LeastConnections => healthy
                .iter()
                .min_by_key(|i| i.connections())
                .cloned()
                .unwrap_or_else(|| healthy[0].clone()),
            Strategy::LeastResponseTime => min_by_score(&healthy, |i| i.response_time()),
            Strategy::IpHash => match client_ip {
                Some(ip) => {
                    let index = (hash_ip(ip) % healthy.len() as u64) as usize;
                    healthy[index].clone()
                }
                None => random_choice(&healthy),
            },
            Strategy::Random => random_choice(&healthy),
            Strategy::HealthBased => min_by_score(&healthy, |i| {
                i.response_time() + i.connections() as f64 * HEALTH_SCORE_CONNECTION_WEIGHT
            }),
        };

        debug!(
            service = %service.name,
            instance = %selected.id,
            strategy = service.strategy.as_str(),
            "selected backend instance"
        );

        Some(selected)
    }

    /// Monotonic per-service counter shared across all callers
    fn next_position(&self, service_name: &str) -> usize {
        self.counters
            .entry(service_name.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

/// Minimum by a float score, ties broken by first occurrence in list order
fn min_by_score<F>(instances: &[Arc<ServiceInstance>], score: F) -> Arc<ServiceInstance>
where
    F: Fn(&ServiceInstance) -> f64,
{
    let mut best = instances[0].clone();
    let mut best_score = score(&best);
    for instance in &instances[1..] {
        let s = score(instance);
        if s < best_score {
            best_score = s;
            best = instance.clone();
        }
    }
    best
}

fn random_choice(instances: &[Arc<ServiceInstance>]) -> Arc<ServiceInstance> {
    let index = rand::thread_rng().gen_range(0..instances.len());
    instances[index].clone()
}

/// Stable hash of a client address: first 8 bytes of SHA-256, big endian.
/// Deterministic across processes, unlike the std hasher.
fn hash_ip(ip: IpAddr) -> u64 {
    let digest = Sha256::digest(ip.to_string().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
