#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Health-check cycles: status transitions, persistence and probe concurrency

mod common;

use std::time::{Duration, Instant};

use common::{ROOT, client_for, registration, server_with_status, settings, started};
use httpmock::prelude::*;
use service_registry::{HealthCheck, ServiceInfo, ServiceStatus, ServiceUpdate};

#[tokio::test]
async fn test_status_follows_probe_results() {
    let (registry, backend) = started(settings()).await;

    let server = MockServer::start();
    let mut health = server.mock(|when, then| {
        when.method(GET).path("/health");
        then.status(200);
    });
    let id = registry
        .register(registration(&server, "flappy"))
        .await
        .unwrap();
    assert_eq!(registry.get_service(&id).unwrap().status, ServiceStatus::Healthy);

    let observer_backend = std::sync::Arc::new(backend.new_session());
    let observer = client_for(&observer_backend);
    observer.connect().await.unwrap();
    let path = format!("{ROOT}/{id}");

    health.delete();
    health = server.mock(|when, then| {
        when.method(GET).path("/health");
        then.status(500);
    });
    assert_eq!(registry.perform_health_checks().await, 1);
    assert_eq!(registry.get_service(&id).unwrap().status, ServiceStatus::Unhealthy);
    let persisted = observer.get_node_data::<ServiceInfo>(&path).await.unwrap().unwrap();
    assert_eq!(persisted.status, ServiceStatus::Unhealthy);

    health.delete();
    server.mock(|when, then| {
        when.method(GET).path("/health");
        then.status(200);
    });
    registry.perform_health_checks().await;
    assert_eq!(registry.get_service(&id).unwrap().status, ServiceStatus::Healthy);
    let persisted = observer.get_node_data::<ServiceInfo>(&path).await.unwrap().unwrap();
    assert_eq!(persisted.status, ServiceStatus::Healthy);

    registry.stop().await;
}

#[tokio::test]
async fn test_probes_use_the_configured_endpoint() {
    let (registry, _backend) = started(settings()).await;

    let server = MockServer::start();
    let custom = server.mock(|when, then| {
        when.method(GET).path("/status/ready");
        then.status(200);
    });
    let id = registry
        .register(registration(&server, "custom").with_health_check(HealthCheck {
            endpoint: "/status/ready".to_owned(),
            timeout_seconds: 1,
            ..HealthCheck::default()
        }))
        .await
        .unwrap();

    assert_eq!(registry.get_service(&id).unwrap().status, ServiceStatus::Healthy);
    registry.perform_health_checks().await;
    assert_eq!(custom.calls(), 2);

    registry.stop().await;
}

#[tokio::test]
async fn test_disabled_services_are_not_probed() {
    let (registry, _backend) = started(settings()).await;
    let server = MockServer::start();
    let health = server.mock(|when, then| {
        when.method(GET).path("/health");
        then.status(200);
    });

    let id = registry
        .register(registration(&server, "silent").with_health_check(HealthCheck::disabled()))
        .await
        .unwrap();

    assert_eq!(registry.perform_health_checks().await, 0);
    assert_eq!(health.calls(), 0);
    assert_eq!(registry.get_service(&id).unwrap().status, ServiceStatus::Starting);

    registry.stop().await;
}

#[tokio::test]
async fn test_slow_services_are_probed_concurrently() {
    const SERVICES: usize = 5;
    let (registry, _backend) = started(settings()).await;

    let mut servers = Vec::new();
    let mut ids = Vec::new();
    for i in 0..SERVICES {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(200).delay(Duration::from_secs(3));
        });
        // Registered without probing so registration itself is not slowed down.
        let id = registry
            .register(
                registration(&server, &format!("slow-{i}"))
                    .with_health_check(HealthCheck::disabled()),
            )
            .await
            .unwrap();
        let update = ServiceUpdate {
            health_check: Some(HealthCheck {
                timeout_seconds: 1,
                ..HealthCheck::default()
            }),
            ..ServiceUpdate::default()
        };
        assert!(registry.update(&id, update).await.unwrap());
        servers.push(server);
        ids.push(id);
    }

    let started_at = Instant::now();
    let probed = registry.perform_health_checks().await;
    let elapsed = started_at.elapsed();

    assert_eq!(probed, SERVICES);
    assert!(
        elapsed < Duration::from_millis(2_500),
        "cycle took {} ms; probes were not concurrent",
        elapsed.as_millis()
    );
    for id in &ids {
        assert_eq!(registry.get_service(id).unwrap().status, ServiceStatus::Unhealthy);
    }

    registry.stop().await;
}

#[tokio::test]
async fn test_healthy_cycle_writes_nothing_when_status_is_unchanged() {
    let (registry, backend) = started(settings()).await;
    let server = server_with_status(200);
    let id = registry
        .register(registration(&server, "steady"))
        .await
        .unwrap();

    let observer_backend = std::sync::Arc::new(backend.new_session());
    let observer = client_for(&observer_backend);
    observer.connect().await.unwrap();
    let path = format!("{ROOT}/{id}");
    let before = observer.get_node_data::<ServiceInfo>(&path).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.perform_health_checks().await;

    let after = observer.get_node_data::<ServiceInfo>(&path).await.unwrap().unwrap();
    assert_eq!(before, after);
    assert!(registry.get_service(&id).unwrap().last_heartbeat > before.last_heartbeat);

    registry.stop().await;
}
