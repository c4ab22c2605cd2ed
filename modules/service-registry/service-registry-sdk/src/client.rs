//! HTTP implementation of `ServiceRegistryClientV1` against a remote registry.

use async_trait::async_trait;
use registry_http::{HttpClient, HttpResponse, StatusCode};
use serde::Deserialize;

use crate::api::ServiceRegistryClientV1;
use crate::error::ServiceRegistryError;
use crate::models::{
    DiscoveryQuery, DiscoveryResponse, RegistryStats, ServiceInfo, ServiceRegistration,
    ServiceUpdate,
};

#[derive(Deserialize)]
struct RegisterAck {
    service_id: String,
}

/// REST client for the registry `/api/v1` surface.
#[derive(Debug, Clone)]
pub struct RegistryHttpClient {
    http: HttpClient,
    registry_url: String,
}

impl RegistryHttpClient {
    /// `registry_url` is the registry base URL; trailing slashes are ignored.
    #[must_use]
    pub fn new(http: HttpClient, registry_url: &str) -> Self {
        Self {
            http,
            registry_url: registry_url.trim_end_matches('/').to_owned(),
        }
    }

    #[must_use]
    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    /// Build `{registry_url}/api/v1/{segments...}` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<String, ServiceRegistryError> {
        let mut url = url::Url::parse(&self.registry_url).map_err(|e| {
            ServiceRegistryError::validation(format!(
                "invalid registry url '{}': {e}",
                self.registry_url
            ))
        })?;
        url.path_segments_mut()
            .map_err(|()| {
                ServiceRegistryError::validation(format!(
                    "registry url '{}' cannot be a base",
                    self.registry_url
                ))
            })?
            .pop_if_empty()
            .extend(["api", "v1"])
            .extend(segments);
        Ok(url.into())
    }

    async fn fetch_optional(
        resp: HttpResponse,
    ) -> Result<Option<ServiceInfo>, ServiceRegistryError> {
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(resp.json().await?))
    }

    async fn found(resp: HttpResponse) -> Result<bool, ServiceRegistryError> {
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        resp.checked_bytes().await?;
        Ok(true)
    }
}

#[async_trait]
impl ServiceRegistryClientV1 for RegistryHttpClient {
    async fn register_service(
        &self,
        registration: ServiceRegistration,
    ) -> Result<String, ServiceRegistryError> {
        let url = self.endpoint(&["register"])?;
        let ack: RegisterAck = self
            .http
            .post(&url)
            .json(&registration)?
            .send()
            .await?
            .json()
            .await?;
        Ok(ack.service_id)
    }

    async fn unregister_service(&self, service_id: &str) -> Result<bool, ServiceRegistryError> {
        let url = self.endpoint(&["unregister", service_id])?;
        Self::found(self.http.delete(&url).send().await?).await
    }

    async fn update_service(
        &self,
        service_id: &str,
        update: ServiceUpdate,
    ) -> Result<bool, ServiceRegistryError> {
        let url = self.endpoint(&["update", service_id])?;
        Self::found(self.http.put(&url).json(&update)?.send().await?).await
    }

    async fn get_service(
        &self,
        service_id: &str,
    ) -> Result<Option<ServiceInfo>, ServiceRegistryError> {
        let url = self.endpoint(&["services", service_id])?;
        Self::fetch_optional(self.http.get(&url).send().await?).await
    }

    async fn get_service_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ServiceInfo>, ServiceRegistryError> {
        let url = self.endpoint(&["services", "name", name])?;
        Self::fetch_optional(self.http.get(&url).send().await?).await
    }

    async fn discover_services(
        &self,
        query: DiscoveryQuery,
    ) -> Result<DiscoveryResponse, ServiceRegistryError> {
        let url = self.endpoint(&["discover"])?;
        Ok(self
            .http
            .post(&url)
            .json(&query)?
            .send()
            .await?
            .json()
            .await?)
    }

    async fn heartbeat(&self, service_id: &str) -> Result<bool, ServiceRegistryError> {
        let url = self.endpoint(&["heartbeat", service_id])?;
        Self::found(self.http.post(&url).send().await?).await
    }

    async fn get_registry_stats(&self) -> Result<RegistryStats, ServiceRegistryError> {
        let url = self.endpoint(&["stats"])?;
        Ok(self.http.get(&url).send().await?.json().await?)
    }
}
