//! # Health Checking Module
//!
//! Periodically probes every registered instance's health endpoint and flips
//! its `healthy` flag based on the response. Probe failures are isolated: a
//! dead backend marks only that instance, never aborts the tick, and never
//! stops the loop.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Service, ServiceInstance, ServiceRegistry};

/// Hard ceiling on a single probe; a health endpoint slower than this is
/// treated the same as one that is down.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Background prober for backend instance health
pub struct HealthChecker {
    registry: Arc<ServiceRegistry>,
    client: reqwest::Client,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(registry: Arc<ServiceRegistry>, interval: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::internal(format!("health check client: {}", e)))?;

        Ok(Self {
            registry,
            client,
            interval,
        })
    }

    /// Run probe ticks until the token is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "health checker started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_all().await,
                _ = shutdown.cancelled() => {
                    info!("health checker stopped");
                    return;
                }
            }
        }
    }

    /// Probe every instance of every service once
    pub async fn check_all(&self) {
        for service in self.registry.all() {
            for instance in service.instances() {
                self.check_instance(&service, &instance).await;
            }
        }
    }

    /// Probe one instance and update its health flag
    ///
    /// Never returns an error: any probe failure is recorded as unhealthy
    /// and logged, so one bad backend cannot disturb the rest of the tick.
    pub async fn check_instance(&self, service: &Service, instance: &Arc<ServiceInstance>) {
        let url = format!("{}{}", instance.url(), service.health_check_path);
        let was_healthy = instance.is_healthy();
        let started = Instant::now();

        let healthy = match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                instance.observe_response_time(started.elapsed());
                true
            }
            Ok(response) => {
                warn!(
                    service = %service.name,
                    instance = %instance.id,
                    status = %response.status(),
                    "health probe returned non-success status"
                );
                false
            }
            Err(err) => {
                warn!(
                    service = %service.name,
                    instance = %instance.id,
                    error = %err,
                    "health probe failed"
                );
                false
            }
        };

        instance.set_healthy(healthy);
        instance.mark_checked();

        if healthy != was_healthy {
            info!(
                service = %service.name,
                instance = %instance.id,
                healthy,
                "instance health changed"
            );
        } else {
            debug!(
                service = %service.name,
                instance = %instance.id,
                healthy,
                "health probe complete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{InstanceConfig, ServiceConfig};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn service_with_backend(backend: &MockServer) -> Arc<Service> {
        let addr = backend.address();
        Arc::new(Service::from_config(&ServiceConfig {
            name: "users".to_string(),
            path_prefix: "/users".to_string(),
            instances: vec![InstanceConfig {
                id: "users-1".to_string(),
                host: addr.ip().to_string(),
                port: addr.port(),
                weight: 1,
            }],
            ..Default::default()
        }))
    }

    fn checker(registry: Arc<ServiceRegistry>) -> HealthChecker {
        HealthChecker::new(registry, Duration::from_secs(30)).unwrap()
    }

    #[tokio::test]
    async fn test_successful_probe_marks_healthy_and_records_latency() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&backend)
            .await;

        let service = service_with_backend(&backend).await;
        let instance = service.instances()[0].clone();
        instance.set_healthy(false);

        let registry = Arc::new(ServiceRegistry::new());
        registry.insert(service.clone());

        checker(registry).check_instance(&service, &instance).await;

        assert!(instance.is_healthy());
        assert!(instance.response_time() > 0.0);
        assert!(instance.last_health_check().is_some());
    }

    #[tokio::test]
    async fn test_error_status_marks_unhealthy() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&backend)
            .await;

        let service = service_with_backend(&backend).await;
        let instance = service.instances()[0].clone();
        assert!(instance.is_healthy());

        let registry = Arc::new(ServiceRegistry::new());
        registry.insert(service.clone());

        checker(registry).check_instance(&service, &instance).await;

        assert!(!instance.is_healthy());
        assert!(instance.last_health_check().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_backend_marks_unhealthy() {
        let service = Arc::new(Service::from_config(&ServiceConfig {
            name: "users".to_string(),
            path_prefix: "/users".to_string(),
            instances: vec![InstanceConfig {
                id: "users-1".to_string(),
                host: "127.0.0.1".to_string(),
                // Nothing listens here
                port: 1,
                weight: 1,
            }],
            ..Default::default()
        }));
        let instance = service.instances()[0].clone();

        let registry = Arc::new(ServiceRegistry::new());
        registry.insert(service.clone());

        checker(registry).check_instance(&service, &instance).await;

        assert!(!instance.is_healthy());
    }

    #[tokio::test]
    async fn test_check_all_probes_every_instance() {
        let healthy_backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&healthy_backend)
            .await;

        let service = service_with_backend(&healthy_backend).await;
        service.add_instance(Arc::new(ServiceInstance::new(
            "users-dead",
            "127.0.0.1",
            1,
            1,
        )));

        let registry = Arc::new(ServiceRegistry::new());
        registry.insert(service.clone());

        checker(registry).check_all().await;

        let instances = service.instances();
        assert!(instances.iter().find(|i| i.id == "users-1").unwrap().is_healthy());
        assert!(!instances.iter().find(|i| i.id == "users-dead").unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let registry = Arc::new(ServiceRegistry::new());
        let checker = HealthChecker::new(registry, Duration::from_millis(10)).unwrap();

        let token = CancellationToken::new();
        let handle = tokio::spawn(checker.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("health loop did not stop")
            .unwrap();
    }
}
