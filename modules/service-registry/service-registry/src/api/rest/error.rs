//! REST error mapping for the Service Registry module.

use http::StatusCode;

use super::problem::Problem;
use crate::domain::error::DomainError;

impl From<DomainError> for Problem {
    fn from(e: DomainError) -> Self {
        let trace_id = tracing::Span::current()
            .id()
            .map(|id| id.into_u64().to_string());

        let (status, code, title, detail) = match &e {
            DomainError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                "SERVICE_REGISTRY_NOT_FOUND",
                "Service not found",
                "Service not found".to_owned(),
            ),
            DomainError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "SERVICE_REGISTRY_VALIDATION",
                "Invalid request",
                msg.clone(),
            ),
            DomainError::NotHealthy(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_REGISTRY_NOT_HEALTHY",
                "Service unavailable",
                "Service is not healthy".to_owned(),
            ),
            DomainError::UpstreamUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_REGISTRY_UPSTREAM_UNAVAILABLE",
                "Service unavailable",
                e.to_string(),
            ),
            DomainError::UpstreamStatus(_) => (
                StatusCode::BAD_GATEWAY,
                "SERVICE_REGISTRY_UPSTREAM_ERROR",
                "Bad gateway",
                e.to_string(),
            ),
            DomainError::RegistrationFailed(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERVICE_REGISTRY_REGISTRATION_FAILED",
                "Registration failed",
                e.to_string(),
            ),
            DomainError::Coordination(err) => {
                tracing::error!(error = %err, "coordination error in service_registry");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "SERVICE_REGISTRY_COORDINATION",
                    "Internal Server Error",
                    "The coordination backend request failed".to_owned(),
                )
            }
            DomainError::Internal(err) => {
                tracing::error!(error = %err, "internal error in service_registry");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "SERVICE_REGISTRY_INTERNAL",
                    "Internal Server Error",
                    "An internal error occurred".to_owned(),
                )
            }
        };

        let mut problem = Problem::new(status, title, detail)
            .with_type(format!("urn:service-registry:error:{code}"))
            .with_code(code);

        if let Some(id) = trace_id {
            problem = problem.with_trace_id(id);
        }

        problem
    }
}
