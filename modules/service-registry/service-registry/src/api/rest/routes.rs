//! Route table of the registry REST API.

use std::sync::Arc;

use axum::Router;
use axum::extract::Extension;
use axum::routing::{delete, get, post, put};
use service_registry_sdk::API_PREFIX;

use super::handlers::{self, RegistryInfo};
use crate::domain::service::ServiceRegistryService;
use crate::domain::tools::ToolsProxy;

/// Routes mounted under [`API_PREFIX`].
fn api_routes() -> Router {
    Router::new()
        .route("/register", post(handlers::register_service))
        .route("/unregister/{service_id}", delete(handlers::unregister_service))
        .route("/update/{service_id}", put(handlers::update_service))
        .route("/services/{service_id}", get(handlers::get_service))
        .route("/services/name/{name}", get(handlers::get_service_by_name))
        .route(
            "/discover",
            post(handlers::discover_services).get(handlers::discover_services_get),
        )
        .route("/heartbeat/{service_id}", post(handlers::heartbeat))
        .route("/stats", get(handlers::get_registry_stats))
        .route("/cleanup", post(handlers::cleanup_stale_services))
        .route("/tools", get(handlers::get_all_tools))
        .route("/tools/by-name/{name}", get(handlers::get_service_tools_by_name))
        .route("/tools/{service_id}", get(handlers::get_service_tools))
        .route("/health", get(handlers::registry_health))
}

/// Merge the registry routes into `router` and attach their dependencies.
#[must_use]
pub fn register_routes(
    router: Router,
    service: Arc<ServiceRegistryService>,
    tools: Arc<ToolsProxy>,
    info: Arc<RegistryInfo>,
) -> Router {
    router
        .route("/", get(handlers::root_info))
        .route("/health", get(handlers::process_health))
        .nest(API_PREFIX, api_routes())
        .layer(Extension(service))
        .layer(Extension(tools))
        .layer(Extension(info))
}
