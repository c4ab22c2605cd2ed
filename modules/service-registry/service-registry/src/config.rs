//! Configuration for the Service Registry module.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{DomainError, RegistrySettings};
use crate::infra::coordination::{EtcdConfig, EtcdCoordination, MemoryCoordination};
use crate::infra::{CoordinationBackend, CoordinationClient};

/// Which coordination backend the registry connects to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process store; records live only as long as the process
    Memory,
    #[default]
    Etcd,
}

/// Connection settings for the coordination backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CoordinationConfig {
    pub backend: BackendKind,

    /// Backend host list, `host:port` each.
    /// Default: `["localhost:2379"]`
    pub endpoints: Vec<String>,

    /// Upper bound for connecting and for every backend call.
    pub timeout_secs: u64,

    /// Lifetime of the session lease; ephemeral records vanish this long after
    /// the registry stops renewing it.
    pub session_ttl_secs: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            endpoints: vec!["localhost:2379".to_owned()],
            timeout_secs: 10,
            session_ttl_secs: 30,
        }
    }
}

impl CoordinationConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Instantiate the configured backend. Nothing is connected yet.
    #[must_use]
    pub fn build_backend(&self) -> Arc<dyn CoordinationBackend> {
        match self.backend {
            BackendKind::Memory => Arc::new(MemoryCoordination::new()),
            BackendKind::Etcd => Arc::new(EtcdCoordination::new(EtcdConfig {
                endpoints: self.endpoints.clone(),
                timeout: self.timeout(),
                session_ttl: self.session_ttl(),
            })),
        }
    }

    #[must_use]
    pub fn build_client(&self) -> CoordinationClient {
        CoordinationClient::new(self.build_backend(), self.timeout())
    }

    /// # Errors
    /// Returns a validation error describing the first invalid field.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.backend == BackendKind::Etcd && self.endpoints.is_empty() {
            return Err(DomainError::validation(
                "coordination.endpoints must not be empty",
            ));
        }
        if self.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(DomainError::validation(
                "coordination.endpoints must not contain blank entries",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(DomainError::validation(
                "coordination.timeout_secs must be positive",
            ));
        }
        if self.session_ttl_secs < 2 {
            return Err(DomainError::validation(
                "coordination.session_ttl_secs must be at least 2",
            ));
        }
        Ok(())
    }
}

/// Behaviour of the registry engine and its REST surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RegistryConfig {
    /// Backend path holding one node per service.
    pub services_root_path: String,

    pub health_check_interval_secs: u64,

    /// Records without a heartbeat for this long are evicted by cleanup.
    pub service_ttl_secs: u64,

    /// Period of the background stale sweep. `0` disables it; cleanup then
    /// only runs on `POST /api/v1/cleanup`.
    pub cleanup_interval_secs: u64,

    /// Timeout for calls proxied to the `/tools` endpoint of a service.
    pub tools_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            services_root_path: "/services".to_owned(),
            health_check_interval_secs: 30,
            service_ttl_secs: 60,
            cleanup_interval_secs: 0,
            tools_timeout_secs: 30,
        }
    }
}

impl RegistryConfig {
    #[must_use]
    pub fn tools_timeout(&self) -> Duration {
        Duration::from_secs(self.tools_timeout_secs)
    }

    /// Engine settings derived from this config.
    #[must_use]
    pub fn settings(&self) -> RegistrySettings {
        RegistrySettings {
            root_path: self.services_root_path.clone(),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            service_ttl: Duration::from_secs(self.service_ttl_secs),
            cleanup_interval: (self.cleanup_interval_secs > 0)
                .then(|| Duration::from_secs(self.cleanup_interval_secs)),
            ..RegistrySettings::default()
        }
    }

    /// # Errors
    /// Returns a validation error describing the first invalid field.
    pub fn validate(&self) -> Result<(), DomainError> {
        let root = &self.services_root_path;
        if !root.starts_with('/') || root.len() < 2 || root.ends_with('/') {
            return Err(DomainError::validation(format!(
                "registry.services_root_path must be an absolute path without a trailing slash, got '{root}'"
            )));
        }
        if self.health_check_interval_secs == 0 {
            return Err(DomainError::validation(
                "registry.health_check_interval_secs must be positive",
            ));
        }
        if self.service_ttl_secs == 0 {
            return Err(DomainError::validation(
                "registry.service_ttl_secs must be positive",
            ));
        }
        if self.tools_timeout_secs == 0 {
            return Err(DomainError::validation(
                "registry.tools_timeout_secs must be positive",
            ));
        }
        Ok(())
    }
}
