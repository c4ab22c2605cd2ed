//! Proxy for the `/tools` catalog exposed by tool services.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use registry_http::HttpClient;
use serde_json::Value;
use service_registry_sdk::{DiscoveryQuery, ServiceInfo, ServiceType};
use tracing::{debug, error};

use super::error::DomainError;
use super::service::ServiceRegistryService;

/// Tools gathered from every healthy service of one type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolsCatalog {
    /// All tools, each annotated with the service it came from
    pub tools: Vec<Value>,
    /// The same tools grouped by service name
    pub service_tools: BTreeMap<String, Vec<Value>>,
    pub services_count: usize,
}

#[derive(Debug, Clone)]
pub struct ToolsProxy {
    registry: Arc<ServiceRegistryService>,
    http: HttpClient,
}

impl ToolsProxy {
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistryService>, http: HttpClient) -> Self {
        Self { registry, http }
    }

    /// Tools of the service with id `service_id`.
    ///
    /// # Errors
    /// `NotFound`, `NotHealthy`, `UpstreamUnavailable` or `UpstreamStatus`.
    pub async fn fetch_tools(&self, service_id: &str) -> Result<Value, DomainError> {
        let service = self
            .registry
            .get_service(service_id)
            .ok_or_else(|| DomainError::not_found(service_id))?;
        self.fetch_from(&service).await
    }

    /// Tools of a service resolved by name.
    ///
    /// # Errors
    /// Same as [`fetch_tools`](Self::fetch_tools).
    pub async fn fetch_tools_by_name(&self, name: &str) -> Result<Value, DomainError> {
        let service = self
            .registry
            .get_service_by_name(name)
            .ok_or_else(|| DomainError::not_found(name))?;
        self.fetch_from(&service).await
    }

    async fn fetch_from(&self, service: &ServiceInfo) -> Result<Value, DomainError> {
        if !service.is_healthy() {
            return Err(DomainError::not_healthy(&service.name));
        }
        let url = format!("{}/tools", service.base_url());
        debug!(service_id = %service.service_id, url = %url, "fetching tools");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DomainError::upstream_unavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DomainError::UpstreamStatus(status.as_u16()));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| DomainError::upstream_unavailable(e.to_string()))
    }

    /// Collect the `tools` arrays of all healthy services of `service_type`.
    ///
    /// Services that fail to answer are logged and left out.
    pub async fn aggregate(&self, service_type: ServiceType) -> ToolsCatalog {
        let services = self
            .registry
            .discover(DiscoveryQuery::default().with_type(service_type))
            .services;
        let responses = join_all(services.iter().map(|s| self.fetch_from(s))).await;

        let mut catalog = ToolsCatalog {
            services_count: services.len(),
            ..ToolsCatalog::default()
        };
        for (service, response) in services.iter().zip(responses) {
            match response {
                Ok(body) => {
                    let tools = annotate(service, body);
                    catalog.tools.extend(tools.iter().cloned());
                    catalog
                        .service_tools
                        .entry(service.name.clone())
                        .or_default()
                        .extend(tools);
                }
                Err(e) => {
                    error!(
                        service_id = %service.service_id,
                        name = %service.name,
                        error = %e,
                        "failed to get tools from service"
                    );
                }
            }
        }
        catalog
    }
}

/// Tag every tool object with the service it came from.
fn annotate(service: &ServiceInfo, body: Value) -> Vec<Value> {
    let Value::Object(mut body) = body else {
        return Vec::new();
    };
    let Some(Value::Array(tools)) = body.remove("tools") else {
        return Vec::new();
    };
    let service_url = service.base_url();
    tools
        .into_iter()
        .map(|mut tool| {
            if let Value::Object(fields) = &mut tool {
                fields.insert("service_id".to_owned(), Value::from(service.service_id.as_str()));
                fields.insert("service_name".to_owned(), Value::from(service.name.as_str()));
                fields.insert("service_url".to_owned(), Value::from(service_url.as_str()));
            }
            tool
        })
        .collect()
}
