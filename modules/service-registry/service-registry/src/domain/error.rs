//! Domain error types for the Service Registry module.

use service_registry_sdk::ServiceRegistryError;
use thiserror::Error;

use crate::infra::CoordinationError;

/// Domain-level errors for the Service Registry module.
#[derive(Error, Debug)]
pub enum DomainError {
    /// No service with the given id or name.
    #[error("Service not found: {0}")]
    NotFound(String),

    /// The request is malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The service exists but its last probe failed.
    #[error("Service '{0}' is not healthy")]
    NotHealthy(String),

    /// A proxied call could not reach the service.
    #[error("Failed to connect to service: {0}")]
    UpstreamUnavailable(String),

    /// A proxied call got a non-success status.
    #[error("Service returned error: {0}")]
    UpstreamStatus(u16),

    /// The service record could not be persisted.
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DomainError {
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    #[must_use]
    pub fn not_healthy(name: impl Into<String>) -> Self {
        Self::NotHealthy(name.into())
    }

    #[must_use]
    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(message.into())
    }

    #[must_use]
    pub fn registration_failed(message: impl Into<String>) -> Self {
        Self::RegistrationFailed(message.into())
    }
}

impl From<DomainError> for ServiceRegistryError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::NotFound(id) => ServiceRegistryError::not_found(id),
            DomainError::Validation(msg) => ServiceRegistryError::validation(msg),
            DomainError::NotHealthy(name) => ServiceRegistryError::unavailable(name),
            DomainError::UpstreamUnavailable(msg) => ServiceRegistryError::Transport(msg),
            DomainError::UpstreamStatus(status) => ServiceRegistryError::Upstream {
                status,
                body: String::new(),
            },
            e @ (DomainError::RegistrationFailed(_)
            | DomainError::Coordination(_)
            | DomainError::Internal(_)) => ServiceRegistryError::internal(e.to_string()),
        }
    }
}
