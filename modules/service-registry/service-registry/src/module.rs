//! Module declaration for the Service Registry module.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use registry_http::HttpClient;
use service_registry_sdk::ServiceRegistryClientV1;
use tracing::{debug, info};

use crate::api::rest::handlers::RegistryInfo;
use crate::config::{CoordinationConfig, RegistryConfig};
use crate::domain::service::ServiceRegistryService;
use crate::domain::{HealthProber, ToolsProxy};
use crate::infra::CoordinationClient;
use crate::local_client::ServiceRegistryLocalClient;

/// Service Registry module.
///
/// Owns the registry engine, the tools proxy and the REST surface built on
/// them. The lifecycle is `init`, `start`, `register_rest`, then `stop`.
#[derive(Clone)]
pub struct ServiceRegistryModule {
    service: Arc<ServiceRegistryService>,
    tools: Arc<ToolsProxy>,
    info: Arc<RegistryInfo>,
}

impl ServiceRegistryModule {
    /// Build the module against the configured coordination backend.
    ///
    /// # Errors
    /// Returns an error if either config section is invalid.
    pub fn init(
        coordination: &CoordinationConfig,
        registry: &RegistryConfig,
    ) -> anyhow::Result<Self> {
        info!("Initializing service_registry module");
        coordination
            .validate()
            .context("invalid coordination config")?;
        debug!(
            backend = ?coordination.backend,
            endpoints = %coordination.endpoints.join(","),
            "Loaded coordination config"
        );
        Self::with_coordination(
            coordination.build_client(),
            coordination.endpoints.clone(),
            registry,
        )
    }

    /// Build the module on an already constructed coordination client.
    ///
    /// # Errors
    /// Returns an error if the registry config is invalid.
    pub fn with_coordination(
        coordination: CoordinationClient,
        endpoints: Vec<String>,
        registry: &RegistryConfig,
    ) -> anyhow::Result<Self> {
        registry.validate().context("invalid registry config")?;
        debug!(
            root = %registry.services_root_path,
            health_check_interval_secs = registry.health_check_interval_secs,
            service_ttl_secs = registry.service_ttl_secs,
            "Loaded service_registry config"
        );

        let service = Arc::new(ServiceRegistryService::new(
            coordination,
            HealthProber::default(),
            registry.settings(),
        ));
        let tools_http = HttpClient::builder()
            .timeout(registry.tools_timeout())
            .build();
        let tools = Arc::new(ToolsProxy::new(Arc::clone(&service), tools_http));

        info!("Service registry module initialized");
        Ok(Self {
            service,
            tools,
            info: Arc::new(RegistryInfo::new(endpoints)),
        })
    }

    /// Connect to the backend and launch the background tasks.
    ///
    /// # Errors
    /// Returns an error if the coordination backend cannot be reached; the
    /// registry must not serve without it.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.service
            .start()
            .await
            .context("failed to start service registry")
    }

    pub async fn stop(&self) {
        self.service.stop().await;
    }

    /// Mount the registry routes on `router`.
    #[must_use]
    pub fn register_rest(&self, router: Router) -> Router {
        info!("Registering service_registry REST routes");
        crate::api::rest::routes::register_routes(
            router,
            Arc::clone(&self.service),
            Arc::clone(&self.tools),
            Arc::clone(&self.info),
        )
    }

    /// A fresh router holding only the registry routes.
    #[must_use]
    pub fn router(&self) -> Router {
        self.register_rest(Router::new())
    }

    #[must_use]
    pub fn service(&self) -> Arc<ServiceRegistryService> {
        Arc::clone(&self.service)
    }

    /// In-process implementation of the public registry API.
    #[must_use]
    pub fn client(&self) -> Arc<dyn ServiceRegistryClientV1> {
        Arc::new(ServiceRegistryLocalClient::new(Arc::clone(&self.service)))
    }
}
