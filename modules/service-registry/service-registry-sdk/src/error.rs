//! Error types for the service registry SDK.

use registry_http::HttpError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceRegistryError {
    #[error("Service not found: {0}")]
    NotFound(String),

    /// No healthy instance resolved for a service name
    #[error("Service '{0}' not found or unhealthy")]
    ServiceUnavailable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// The client has no registered service id
    #[error("Service is not registered")]
    NotRegistered,

    /// Network failure, timeout, or malformed response
    #[error("Request failed: {0}")]
    Transport(String),

    /// Remote side answered with a non-success status
    #[error("Service returned error: {status}")]
    Upstream { status: u16, body: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceRegistryError {
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    #[must_use]
    pub fn unavailable(name: impl Into<String>) -> Self {
        Self::ServiceUnavailable(name.into())
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<HttpError> for ServiceRegistryError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::HttpStatus {
                status,
                body_preview,
                ..
            } => Self::Upstream {
                status: status.as_u16(),
                body: body_preview,
            },
            other => Self::Transport(other.to_string()),
        }
    }
}
