//! `ServiceRegistryClientV1` trait definition.

use async_trait::async_trait;

use crate::error::ServiceRegistryError;
use crate::models::{
    DiscoveryQuery, DiscoveryResponse, RegistryStats, ServiceInfo, ServiceRegistration,
    ServiceUpdate,
};

/// Public API of the service registry (Version 1).
///
/// Implemented in-process by the registry module and remotely by
/// [`RegistryHttpClient`](crate::RegistryHttpClient). Unknown ids are not
/// errors: lookups return `None` and mutations return `false`.
#[async_trait]
pub trait ServiceRegistryClientV1: Send + Sync {
    /// Register a service and return its freshly generated id.
    async fn register_service(
        &self,
        registration: ServiceRegistration,
    ) -> Result<String, ServiceRegistryError>;

    /// Remove a service. Returns `false` if the id is unknown.
    async fn unregister_service(&self, service_id: &str) -> Result<bool, ServiceRegistryError>;

    /// Apply a partial update. Returns `false` if the id is unknown.
    async fn update_service(
        &self,
        service_id: &str,
        update: ServiceUpdate,
    ) -> Result<bool, ServiceRegistryError>;

    async fn get_service(
        &self,
        service_id: &str,
    ) -> Result<Option<ServiceInfo>, ServiceRegistryError>;

    /// One of the services with exactly this name; rotates between instances.
    async fn get_service_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ServiceInfo>, ServiceRegistryError>;

    async fn discover_services(
        &self,
        query: DiscoveryQuery,
    ) -> Result<DiscoveryResponse, ServiceRegistryError>;

    /// Refresh the heartbeat timestamp. Returns `false` if the id is unknown.
    async fn heartbeat(&self, service_id: &str) -> Result<bool, ServiceRegistryError>;

    async fn get_registry_stats(&self) -> Result<RegistryStats, ServiceRegistryError>;
}
