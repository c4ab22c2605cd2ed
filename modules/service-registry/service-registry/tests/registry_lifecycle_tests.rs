#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end engine behaviour: registration lifecycle, background probing
//! and stale eviction on the in-memory backend

mod common;

use std::time::Duration;

use common::{
    ROOT, client_for, eventually, healthy_server, registration, settings, settings_with_interval,
    started,
};
use httpmock::prelude::*;
use service_registry::domain::RegistrySettings;
use service_registry::{
    DiscoveryQuery, HealthCheck, ServiceInfo, ServiceStatus, ServiceType, ServiceUpdate,
};

const WAIT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn test_unreachable_service_drops_out_of_discovery() {
    let (registry, _backend) = started(settings_with_interval(Duration::from_millis(200))).await;

    let server = MockServer::start();
    let mut health = server.mock(|when, then| {
        when.method(GET).path("/health");
        then.status(200);
    });

    let id = registry
        .register(registration(&server, "calc"))
        .await
        .unwrap();
    assert_eq!(registry.get_service(&id).unwrap().status, ServiceStatus::Healthy);

    let discovered = registry.discover(DiscoveryQuery::default().with_type(ServiceType::Tool));
    assert_eq!(discovered.total_count, 1);
    assert_eq!(discovered.services[0].service_id, id);

    // The service goes away: its health endpoint stops answering 200.
    health.delete();

    assert!(
        eventually(WAIT, || {
            registry.get_service(&id).map(|s| s.status) == Some(ServiceStatus::Unhealthy)
        })
        .await
    );

    let discovered = registry.discover(DiscoveryQuery::default().with_type(ServiceType::Tool));
    assert_eq!(discovered.total_count, 0);
    assert!(discovered.services.is_empty());

    let everything = registry.discover(DiscoveryQuery::any());
    assert_eq!(everything.total_count, 1);
    assert_eq!(everything.services[0].status, ServiceStatus::Unhealthy);

    registry.stop().await;
}

#[tokio::test]
async fn test_registered_record_is_persisted_as_json() {
    let (registry, backend) = started(settings()).await;
    let server = healthy_server();

    let id = registry
        .register(registration(&server, "calc"))
        .await
        .unwrap();

    let observer_backend = std::sync::Arc::new(backend.new_session());
    let observer = client_for(&observer_backend);
    observer.connect().await.unwrap();

    let children = observer.get_children(ROOT).await.unwrap();
    assert_eq!(children, vec![id.clone()]);

    let raw = observer
        .get_node_data::<serde_json::Value>(&format!("{ROOT}/{id}"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw["service_id"], id.as_str());
    assert_eq!(raw["service_type"], "tool");
    assert_eq!(raw["status"], "healthy");
    // Timestamps are ISO-8601 strings.
    let registered_at = raw["registered_at"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(registered_at).is_ok());

    let record: ServiceInfo = serde_json::from_value(raw).unwrap();
    assert_eq!(record, registry.get_service(&id).unwrap());

    registry.stop().await;
}

#[tokio::test]
async fn test_background_sweep_evicts_silent_services() {
    let (registry, backend) = started(RegistrySettings {
        service_ttl: Duration::from_millis(300),
        cleanup_interval: Some(Duration::from_millis(100)),
        ..settings()
    })
    .await;

    let server = healthy_server();
    // Without probing nothing refreshes the heartbeat.
    let id = registry
        .register(registration(&server, "quiet").with_health_check(HealthCheck::disabled()))
        .await
        .unwrap();
    assert!(registry.get_service(&id).is_some());

    assert!(eventually(WAIT, || registry.get_service(&id).is_none()).await);

    let observer_backend = std::sync::Arc::new(backend.new_session());
    let observer = client_for(&observer_backend);
    observer.connect().await.unwrap();
    assert!(observer.get_children(ROOT).await.unwrap().is_empty());

    registry.stop().await;
}

#[tokio::test]
async fn test_heartbeats_keep_services_alive() {
    let (registry, _backend) = started(RegistrySettings {
        service_ttl: Duration::from_millis(400),
        cleanup_interval: Some(Duration::from_millis(100)),
        ..settings()
    })
    .await;

    let server = healthy_server();
    let id = registry
        .register(registration(&server, "chatty").with_health_check(HealthCheck::disabled()))
        .await
        .unwrap();

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.heartbeat(&id).await, "service evicted despite heartbeats");
    }
    assert!(registry.get_service(&id).is_some());

    registry.stop().await;
}

#[tokio::test]
async fn test_successful_probes_count_as_heartbeats() {
    let (registry, _backend) = started(RegistrySettings {
        health_check_interval: Duration::from_millis(100),
        service_ttl: Duration::from_millis(500),
        cleanup_interval: Some(Duration::from_millis(100)),
        ..settings()
    })
    .await;

    let server = healthy_server();
    let id = registry
        .register(registration(&server, "probed"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(registry.get_service(&id).is_some());

    registry.stop().await;
}

#[tokio::test]
async fn test_manual_status_update_is_visible_to_discovery() {
    let (registry, _backend) = started(settings()).await;
    let server = healthy_server();
    let id = registry
        .register(registration(&server, "calc"))
        .await
        .unwrap();

    let update = ServiceUpdate {
        status: Some(ServiceStatus::Stopping),
        ..ServiceUpdate::default()
    };
    assert!(registry.update(&id, update).await.unwrap());

    assert_eq!(registry.discover(DiscoveryQuery::default()).total_count, 0);
    let stopping = registry.discover(DiscoveryQuery::any().with_status(Some(ServiceStatus::Stopping)));
    assert_eq!(stopping.total_count, 1);

    let stats = registry.stats();
    assert_eq!(stats.total_services, 1);
    assert_eq!(stats.healthy_services, 0);
    assert_eq!(stats.unhealthy_services, 1);
    assert_eq!(stats.services_by_status.get(&ServiceStatus::Stopping), Some(&1));

    registry.stop().await;
}

#[tokio::test]
async fn test_stop_releases_records_and_restart_reloads() {
    let (registry, backend) = started(settings()).await;
    let server = healthy_server();
    registry
        .register(registration(&server, "calc"))
        .await
        .unwrap();
    registry.stop().await;
    assert!(!registry.is_connected());

    // Ephemeral records went away with the session.
    let restarted = common::engine_on(&backend, settings());
    restarted.start().await.unwrap();
    assert_eq!(restarted.service_count(), 0);
    restarted.stop().await;
}
