//! Public models of the service registry.
//!
//! These types are the wire contract of the registry HTTP API and the
//! persisted form of a service record in the coordination backend.
//! Timestamps are UTC and serialize as RFC 3339 strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Kind of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Agent,
    Tool,
    Api,
    Database,
    Gateway,
    Other,
}

impl ServiceType {
    pub const ALL: [ServiceType; 6] = [
        ServiceType::Agent,
        ServiceType::Tool,
        ServiceType::Api,
        ServiceType::Database,
        ServiceType::Gateway,
        ServiceType::Other,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Agent => "agent",
            ServiceType::Tool => "tool",
            ServiceType::Api => "api",
            ServiceType::Database => "database",
            ServiceType::Gateway => "gateway",
            ServiceType::Other => "other",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown service type '{s}'"))
    }
}

/// Health state of a registered service.
///
/// `Starting` is only held between registration and the first probe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
    #[default]
    Unknown,
}

impl ServiceStatus {
    pub const ALL: [ServiceStatus; 5] = [
        ServiceStatus::Starting,
        ServiceStatus::Healthy,
        ServiceStatus::Unhealthy,
        ServiceStatus::Stopping,
        ServiceStatus::Unknown,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceStatus::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| format!("unknown service status '{s}'"))
    }
}

/// Descriptive block used for discovery filtering.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceMetadata {
    pub description: Option<String>,
    pub version: Option<String>,
    pub tags: BTreeSet<String>,
    pub capabilities: BTreeSet<String>,
    pub dependencies: Vec<String>,
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ServiceMetadata {
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }
}

/// Health-check policy of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheck {
    pub enabled: bool,
    /// Probe path appended to the service base URL
    pub endpoint: String,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub retries: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "/health".to_owned(),
            interval_seconds: 30,
            timeout_seconds: 5,
            retries: 3,
        }
    }
}

impl HealthCheck {
    /// Probe timeout as a `Duration`
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// A policy with probing switched off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// A registered service record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_id: String,
    pub name: String,
    pub service_type: ServiceType,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default)]
    pub metadata: ServiceMetadata,
    #[serde(default)]
    pub health_check: HealthCheck,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceInfo {
    /// `http://{host}:{port}`
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Base URL joined with the health-check endpoint
    #[must_use]
    pub fn health_url(&self) -> String {
        let endpoint = &self.health_check.endpoint;
        if endpoint.starts_with('/') {
            format!("{}{endpoint}", self.base_url())
        } else {
            format!("{}/{endpoint}", self.base_url())
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == ServiceStatus::Healthy
    }
}

/// Registration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub name: String,
    pub service_type: ServiceType,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ServiceMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

impl ServiceRegistration {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        service_type: ServiceType,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            service_type,
            host: host.into(),
            port,
            metadata: None,
            health_check: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: ServiceMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn with_health_check(mut self, health_check: HealthCheck) -> Self {
        self.health_check = Some(health_check);
        self
    }
}

/// Partial update; only present fields are applied.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ServiceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ServiceMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

fn default_query_status() -> Option<ServiceStatus> {
    Some(ServiceStatus::Healthy)
}

/// Discovery filters. Every present filter must match.
///
/// An omitted `status` means `healthy`; an explicit `null` disables the status filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    #[serde(default)]
    pub service_type: Option<ServiceType>,
    /// Case-insensitive substring of the service name
    #[serde(default)]
    pub name: Option<String>,
    /// Required subset of the service tags
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    /// Required subset of the service capabilities
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default = "default_query_status")]
    pub status: Option<ServiceStatus>,
}

impl Default for DiscoveryQuery {
    fn default() -> Self {
        Self {
            service_type: None,
            name: None,
            tags: None,
            capabilities: None,
            status: default_query_status(),
        }
    }
}

impl DiscoveryQuery {
    /// Query without any filter, including status.
    #[must_use]
    pub fn any() -> Self {
        Self {
            status: None,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = Some(service_type);
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: Option<ServiceStatus>) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = Some(capabilities.into_iter().map(Into::into).collect());
        self
    }

    /// True if `service` satisfies every present filter.
    #[must_use]
    pub fn matches(&self, service: &ServiceInfo) -> bool {
        if self
            .service_type
            .is_some_and(|t| t != service.service_type)
        {
            return false;
        }

        if let Some(name) = &self.name
            && !service
                .name
                .to_lowercase()
                .contains(&name.to_lowercase())
        {
            return false;
        }

        if self.status.is_some_and(|s| s != service.status) {
            return false;
        }

        if let Some(tags) = &self.tags
            && !tags.iter().all(|t| service.metadata.tags.contains(t))
        {
            return false;
        }

        if let Some(capabilities) = &self.capabilities
            && !capabilities
                .iter()
                .all(|c| service.metadata.capabilities.contains(c))
        {
            return false;
        }

        true
    }
}

/// Discovery result: all matches plus the echoed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub services: Vec<ServiceInfo>,
    pub total_count: usize,
    pub query: DiscoveryQuery,
}

/// Aggregate counts computed from the registry cache.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub services_by_type: BTreeMap<ServiceType, usize>,
    pub services_by_status: BTreeMap<ServiceStatus, usize>,
    pub healthy_services: usize,
    /// Every non-healthy record, including `starting` and `unknown`
    pub unhealthy_services: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service(name: &str, tags: &[&str]) -> ServiceInfo {
        ServiceInfo {
            service_id: "id-1".to_owned(),
            name: name.to_owned(),
            service_type: ServiceType::Tool,
            host: "127.0.0.1".to_owned(),
            port: 9001,
            status: ServiceStatus::Healthy,
            metadata: ServiceMetadata::default().with_tags(tags.iter().copied()),
            health_check: HealthCheck::default(),
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
        }
    }

    #[test]
    fn urls_are_derived_from_host_port_and_endpoint() {
        let mut svc = service("calc", &[]);
        assert_eq!(svc.base_url(), "http://127.0.0.1:9001");
        assert_eq!(svc.health_url(), "http://127.0.0.1:9001/health");

        svc.health_check.endpoint = "status/live".to_owned();
        assert_eq!(svc.health_url(), "http://127.0.0.1:9001/status/live");
    }

    #[test]
    fn registration_defaults_when_optional_blocks_missing() {
        let reg: ServiceRegistration = serde_json::from_value(json!({
            "name": "calc",
            "service_type": "tool",
            "host": "127.0.0.1",
            "port": 9001,
            "health_check": {"endpoint": "/ping"}
        }))
        .unwrap();

        assert!(reg.metadata.is_none());
        let hc = reg.health_check.unwrap();
        assert_eq!(hc.endpoint, "/ping");
        assert!(hc.enabled);
        assert_eq!(hc.timeout_seconds, 5);
        assert_eq!(hc.interval_seconds, 30);
        assert_eq!(hc.retries, 3);
    }

    #[test]
    fn discovery_query_status_defaults_to_healthy_but_null_disables_it() {
        let q: DiscoveryQuery = serde_json::from_value(json!({})).unwrap();
        assert_eq!(q.status, Some(ServiceStatus::Healthy));

        let q: DiscoveryQuery = serde_json::from_value(json!({"status": null})).unwrap();
        assert_eq!(q.status, None);
    }

    #[test]
    fn query_tags_must_be_subset_of_service_tags() {
        let a = service("alpha", &["x", "y"]);
        let b = service("beta", &["x"]);
        let q = DiscoveryQuery::default().with_tags(["x", "y"]);

        assert!(q.matches(&a));
        assert!(!q.matches(&b));
    }

    #[test]
    fn name_filter_is_case_insensitive_substring() {
        let svc = service("Calculator-Tool", &[]);
        assert!(DiscoveryQuery::default().with_name("calc").matches(&svc));
        assert!(DiscoveryQuery::default().with_name("TOOL").matches(&svc));
        assert!(!DiscoveryQuery::default().with_name("scraper").matches(&svc));
    }

    #[test]
    fn stats_maps_serialize_with_lowercase_keys() {
        let mut stats = RegistryStats::default();
        stats.services_by_type.insert(ServiceType::Tool, 2);
        stats.services_by_status.insert(ServiceStatus::Healthy, 2);

        let v = serde_json::to_value(&stats).unwrap();
        assert_eq!(v["services_by_type"]["tool"], 2);
        assert_eq!(v["services_by_status"]["healthy"], 2);
    }

    #[test]
    fn enums_parse_from_wire_strings() {
        assert_eq!("gateway".parse::<ServiceType>(), Ok(ServiceType::Gateway));
        assert_eq!("unhealthy".parse::<ServiceStatus>(), Ok(ServiceStatus::Unhealthy));
        assert!("bogus".parse::<ServiceType>().is_err());
    }
}
