//! REST DTOs for the Service Registry module.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_registry_sdk::{DiscoveryQuery, ServiceStatus, ServiceType};

use crate::domain::{DomainError, ToolsCatalog};

/// Response for `POST /register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub service_id: String,
    pub message: String,
}

/// Body of every mutation that only reports success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Response for `POST /cleanup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub message: String,
    pub cleaned_count: usize,
}

/// Query parameters of `GET /discover`.
///
/// `tags` and `capabilities` are comma-separated. An absent `status` means
/// `healthy`; `status=any` matches every status.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoverParams {
    pub service_type: Option<ServiceType>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub tags: Option<String>,
    pub capabilities: Option<String>,
}

impl DiscoverParams {
    /// # Errors
    /// Returns a validation error for an unknown `status` value.
    pub fn into_query(self) -> Result<DiscoveryQuery, DomainError> {
        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") => Some(ServiceStatus::Healthy),
            Some("any") => None,
            Some(raw) => Some(raw.parse::<ServiceStatus>().map_err(DomainError::validation)?),
        };
        Ok(DiscoveryQuery {
            service_type: self.service_type,
            name: self.name.filter(|n| !n.is_empty()),
            tags: self.tags.as_deref().map(split_list),
            capabilities: self.capabilities.as_deref().map(split_list),
            status,
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Query parameters of `GET /tools`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsQuery {
    pub service_type: ServiceType,
}

impl Default for ToolsQuery {
    fn default() -> Self {
        Self {
            service_type: ServiceType::Tool,
        }
    }
}

/// Response for `GET /tools`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsCatalogResponse {
    pub tools: Vec<Value>,
    pub service_tools: BTreeMap<String, Vec<Value>>,
    pub services_count: usize,
    pub tools_count: usize,
}

impl From<ToolsCatalog> for ToolsCatalogResponse {
    fn from(catalog: ToolsCatalog) -> Self {
        Self {
            tools_count: catalog.tools.len(),
            tools: catalog.tools,
            service_tools: catalog.service_tools,
            services_count: catalog.services_count,
        }
    }
}

/// Response for the unprefixed `GET /`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootInfo {
    pub service: String,
    pub version: String,
    pub status: String,
    pub uptime_seconds: f64,
    pub coordination_endpoints: Vec<String>,
    pub services_root_path: String,
}

/// Response for `GET /api/v1/health`: liveness of the registry itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryHealth {
    pub status: String,
    pub service: String,
}

/// Response for the unprefixed `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHealth {
    /// `healthy` while the coordination backend is connected
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub zookeeper_connected: bool,
    pub registered_services: usize,
}
