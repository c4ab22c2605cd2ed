//! Local client implementing the `ServiceRegistryClientV1` trait.

use std::sync::Arc;

use async_trait::async_trait;
use service_registry_sdk::{
    DiscoveryQuery, DiscoveryResponse, RegistryStats, ServiceInfo, ServiceRegistration,
    ServiceRegistryClientV1, ServiceRegistryError, ServiceUpdate,
};

use crate::domain::service::ServiceRegistryService;

/// In-process client for the Service Registry module.
///
/// Delegates straight to the engine, so callers living in the registry
/// process get the same contract as remote callers of the HTTP API.
pub struct ServiceRegistryLocalClient {
    service: Arc<ServiceRegistryService>,
}

impl ServiceRegistryLocalClient {
    #[must_use]
    pub fn new(service: Arc<ServiceRegistryService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ServiceRegistryClientV1 for ServiceRegistryLocalClient {
    async fn register_service(
        &self,
        registration: ServiceRegistration,
    ) -> Result<String, ServiceRegistryError> {
        Ok(self.service.register(registration).await?)
    }

    async fn unregister_service(&self, service_id: &str) -> Result<bool, ServiceRegistryError> {
        Ok(self.service.unregister(service_id).await)
    }

    async fn update_service(
        &self,
        service_id: &str,
        update: ServiceUpdate,
    ) -> Result<bool, ServiceRegistryError> {
        Ok(self.service.update(service_id, update).await?)
    }

    async fn get_service(
        &self,
        service_id: &str,
    ) -> Result<Option<ServiceInfo>, ServiceRegistryError> {
        Ok(self.service.get_service(service_id))
    }

    async fn get_service_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ServiceInfo>, ServiceRegistryError> {
        Ok(self.service.get_service_by_name(name))
    }

    async fn discover_services(
        &self,
        query: DiscoveryQuery,
    ) -> Result<DiscoveryResponse, ServiceRegistryError> {
        Ok(self.service.discover(query))
    }

    async fn heartbeat(&self, service_id: &str) -> Result<bool, ServiceRegistryError> {
        Ok(self.service.heartbeat(service_id).await)
    }

    async fn get_registry_stats(&self) -> Result<RegistryStats, ServiceRegistryError> {
        Ok(self.service.stats())
    }
}
