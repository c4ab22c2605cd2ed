//! Health probing of registered services.

use std::fmt;
use std::time::Duration;

use registry_http::{HttpClient, HttpError, StatusCode};
use service_registry_sdk::{ServiceInfo, ServiceStatus};

/// Probes never wait less than this, whatever the stored policy says.
const MIN_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a probe did not count as healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    /// The endpoint answered with something other than 200
    Status(u16),
    Timeout,
    /// Connection refused, reset, invalid URL, ...
    Transport(String),
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "HTTP {status}"),
            Self::Timeout => f.write_str("timed out"),
            Self::Transport(reason) => f.write_str(reason),
        }
    }
}

/// Result of one probe. Failures are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(ProbeFailure),
}

impl ProbeOutcome {
    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        match self {
            Self::Healthy => ServiceStatus::Healthy,
            Self::Unhealthy(_) => ServiceStatus::Unhealthy,
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Issues `GET {base_url}{endpoint}` against a service.
#[derive(Debug, Clone)]
pub struct HealthProber {
    http: HttpClient,
}

impl HealthProber {
    #[must_use]
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Probe `service` within its configured timeout. Only HTTP 200 is healthy.
    pub async fn probe(&self, service: &ServiceInfo) -> ProbeOutcome {
        let timeout = service.health_check.timeout().max(MIN_PROBE_TIMEOUT);
        match self
            .http
            .get(&service.health_url())
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) if response.status() == StatusCode::OK => ProbeOutcome::Healthy,
            Ok(response) => {
                ProbeOutcome::Unhealthy(ProbeFailure::Status(response.status().as_u16()))
            }
            Err(HttpError::Timeout(_)) => ProbeOutcome::Unhealthy(ProbeFailure::Timeout),
            Err(e) => ProbeOutcome::Unhealthy(ProbeFailure::Transport(e.to_string())),
        }
    }
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new(HttpClient::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use service_registry_sdk::{HealthCheck, ServiceMetadata, ServiceType};

    fn service_at(server: &MockServer, endpoint: &str) -> ServiceInfo {
        let now = chrono::Utc::now();
        ServiceInfo {
            service_id: "svc-1".to_owned(),
            name: "calc".to_owned(),
            service_type: ServiceType::Tool,
            host: server.host(),
            port: server.port(),
            status: ServiceStatus::Starting,
            metadata: ServiceMetadata::default(),
            health_check: HealthCheck {
                endpoint: endpoint.to_owned(),
                timeout_seconds: 1,
                ..HealthCheck::default()
            },
            registered_at: now,
            last_heartbeat: now,
        }
    }

    #[tokio::test]
    async fn test_ok_is_healthy() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(200).body("ok");
        });

        let outcome = HealthProber::default()
            .probe(&service_at(&server, "/health"))
            .await;
        assert_eq!(outcome, ProbeOutcome::Healthy);
        mock.assert();
    }

    #[tokio::test]
    async fn test_other_success_codes_are_unhealthy() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/ready");
            then.status(204);
        });

        let outcome = HealthProber::default()
            .probe(&service_at(&server, "ready"))
            .await;
        assert_eq!(outcome, ProbeOutcome::Unhealthy(ProbeFailure::Status(204)));
        assert_eq!(outcome.status(), ServiceStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(200).delay(Duration::from_secs(3));
        });

        let start = std::time::Instant::now();
        let outcome = HealthProber::default()
            .probe(&service_at(&server, "/health"))
            .await;
        assert_eq!(outcome, ProbeOutcome::Unhealthy(ProbeFailure::Timeout));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_failure() {
        let server = MockServer::start();
        let mut service = service_at(&server, "/health");
        service.host = "127.0.0.1".to_owned();
        service.port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let outcome = HealthProber::default().probe(&service).await;
        assert!(matches!(
            outcome,
            ProbeOutcome::Unhealthy(ProbeFailure::Transport(_))
        ));
    }
}
