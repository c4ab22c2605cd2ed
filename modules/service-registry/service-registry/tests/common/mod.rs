#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

//! Common test utilities for service-registry integration tests

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use service_registry::domain::{HealthProber, RegistrySettings, ServiceRegistryService};
use service_registry::infra::{CoordinationBackend, CoordinationClient, MemoryCoordination};
use service_registry::{HealthCheck, ServiceRegistration, ServiceType};

pub const ROOT: &str = "/services";

/// Settings with background probing effectively disabled and fast retries.
pub fn settings() -> RegistrySettings {
    settings_with_interval(Duration::from_secs(3600))
}

pub fn settings_with_interval(health_check_interval: Duration) -> RegistrySettings {
    RegistrySettings {
        root_path: ROOT.to_owned(),
        health_check_interval,
        service_ttl: Duration::from_secs(60),
        cleanup_interval: None,
        retry_delay: Duration::from_millis(50),
    }
}

pub fn client_for(backend: &Arc<MemoryCoordination>) -> CoordinationClient {
    let shared: Arc<dyn CoordinationBackend> = Arc::<MemoryCoordination>::clone(backend);
    CoordinationClient::new(shared, Duration::from_secs(2))
}

/// A registry engine on its own session of `backend`, not yet started.
pub fn engine_on(
    backend: &Arc<MemoryCoordination>,
    settings: RegistrySettings,
) -> Arc<ServiceRegistryService> {
    Arc::new(ServiceRegistryService::new(
        client_for(backend),
        HealthProber::default(),
        settings,
    ))
}

/// A started engine on a fresh in-memory backend.
pub async fn started(
    settings: RegistrySettings,
) -> (Arc<ServiceRegistryService>, Arc<MemoryCoordination>) {
    let backend = Arc::new(MemoryCoordination::new());
    let engine = engine_on(&backend, settings);
    engine.start().await.unwrap();
    (engine, backend)
}

pub fn registration(server: &MockServer, name: &str) -> ServiceRegistration {
    ServiceRegistration::new(name, ServiceType::Tool, server.host(), server.port())
        .with_health_check(HealthCheck {
            timeout_seconds: 1,
            ..HealthCheck::default()
        })
}

/// A probed service answering `status` on `/health`.
pub fn server_with_status(status: u16) -> MockServer {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/health");
        then.status(status);
    });
    server
}

pub fn healthy_server() -> MockServer {
    server_with_status(200)
}

/// Poll `condition` every 20 ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
