//! REST handlers for the Service Registry module.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::{Extension, Path};
use chrono::Utc;
use serde_json::Value;
use service_registry_sdk::{
    DiscoveryQuery, DiscoveryResponse, RegistryStats, ServiceInfo, ServiceRegistration,
    ServiceUpdate,
};

use super::dto::{
    CleanupResponse, DiscoverParams, MessageResponse, ProcessHealth, RegisterResponse,
    RegistryHealth, RootInfo, ToolsCatalogResponse, ToolsQuery,
};
use super::extract::{ApiJson, ApiQuery};
use super::problem::Problem;
use crate::domain::error::DomainError;
use crate::domain::service::ServiceRegistryService;
use crate::domain::tools::ToolsProxy;

pub type RegistryResult<T> = Result<T, Problem>;

const SERVICE_NAME: &str = "service-registry";

/// Process-level facts reported by the unprefixed `/` and `/health` routes.
#[derive(Debug, Clone)]
pub struct RegistryInfo {
    pub version: String,
    pub started_at: Instant,
    pub coordination_endpoints: Vec<String>,
}

impl RegistryInfo {
    #[must_use]
    pub fn new(coordination_endpoints: Vec<String>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            started_at: Instant::now(),
            coordination_endpoints,
        }
    }
}

fn not_found(id: &str) -> Problem {
    DomainError::not_found(id).into()
}

/// POST /api/v1/register
pub async fn register_service(
    Extension(service): Extension<Arc<ServiceRegistryService>>,
    ApiJson(registration): ApiJson<ServiceRegistration>,
) -> RegistryResult<Json<RegisterResponse>> {
    let name = registration.name.clone();
    let service_id = service.register(registration).await?;
    Ok(Json(RegisterResponse {
        service_id,
        message: format!("Service '{name}' registered successfully"),
    }))
}

/// DELETE /api/v1/unregister/{service_id}
pub async fn unregister_service(
    Extension(service): Extension<Arc<ServiceRegistryService>>,
    Path(service_id): Path<String>,
) -> RegistryResult<Json<MessageResponse>> {
    if !service.unregister(&service_id).await {
        return Err(not_found(&service_id));
    }
    Ok(Json(MessageResponse::new(format!(
        "Service '{service_id}' unregistered successfully"
    ))))
}

/// PUT /api/v1/update/{service_id}
pub async fn update_service(
    Extension(service): Extension<Arc<ServiceRegistryService>>,
    Path(service_id): Path<String>,
    ApiJson(update): ApiJson<ServiceUpdate>,
) -> RegistryResult<Json<MessageResponse>> {
    if !service.update(&service_id, update).await? {
        return Err(not_found(&service_id));
    }
    Ok(Json(MessageResponse::new(format!(
        "Service '{service_id}' updated successfully"
    ))))
}

/// GET /api/v1/services/{service_id}
pub async fn get_service(
    Extension(service): Extension<Arc<ServiceRegistryService>>,
    Path(service_id): Path<String>,
) -> RegistryResult<Json<ServiceInfo>> {
    service
        .get_service(&service_id)
        .map(Json)
        .ok_or_else(|| not_found(&service_id))
}

/// GET /api/v1/services/name/{name}
pub async fn get_service_by_name(
    Extension(service): Extension<Arc<ServiceRegistryService>>,
    Path(name): Path<String>,
) -> RegistryResult<Json<ServiceInfo>> {
    service
        .get_service_by_name(&name)
        .map(Json)
        .ok_or_else(|| not_found(&name))
}

/// POST /api/v1/discover
pub async fn discover_services(
    Extension(service): Extension<Arc<ServiceRegistryService>>,
    ApiJson(query): ApiJson<DiscoveryQuery>,
) -> Json<DiscoveryResponse> {
    Json(service.discover(query))
}

/// GET /api/v1/discover
pub async fn discover_services_get(
    Extension(service): Extension<Arc<ServiceRegistryService>>,
    ApiQuery(params): ApiQuery<DiscoverParams>,
) -> RegistryResult<Json<DiscoveryResponse>> {
    let query = params.into_query()?;
    Ok(Json(service.discover(query)))
}

/// POST /api/v1/heartbeat/{service_id}
pub async fn heartbeat(
    Extension(service): Extension<Arc<ServiceRegistryService>>,
    Path(service_id): Path<String>,
) -> RegistryResult<Json<MessageResponse>> {
    if !service.heartbeat(&service_id).await {
        return Err(not_found(&service_id));
    }
    Ok(Json(MessageResponse::new("Heartbeat recorded")))
}

/// GET /api/v1/stats
pub async fn get_registry_stats(
    Extension(service): Extension<Arc<ServiceRegistryService>>,
) -> Json<RegistryStats> {
    Json(service.stats())
}

/// POST /api/v1/cleanup
pub async fn cleanup_stale_services(
    Extension(service): Extension<Arc<ServiceRegistryService>>,
) -> Json<CleanupResponse> {
    let cleaned_count = service.cleanup_stale_services().await;
    Json(CleanupResponse {
        message: format!("Cleaned up {cleaned_count} stale services"),
        cleaned_count,
    })
}

/// GET /api/v1/tools/{service_id}
pub async fn get_service_tools(
    Extension(tools): Extension<Arc<ToolsProxy>>,
    Path(service_id): Path<String>,
) -> RegistryResult<Json<Value>> {
    Ok(Json(tools.fetch_tools(&service_id).await?))
}

/// GET /api/v1/tools/by-name/{name}
pub async fn get_service_tools_by_name(
    Extension(tools): Extension<Arc<ToolsProxy>>,
    Path(name): Path<String>,
) -> RegistryResult<Json<Value>> {
    Ok(Json(tools.fetch_tools_by_name(&name).await?))
}

/// GET /api/v1/tools
///
/// Aggregate the tools of every healthy service of a type.
pub async fn get_all_tools(
    Extension(tools): Extension<Arc<ToolsProxy>>,
    ApiQuery(query): ApiQuery<ToolsQuery>,
) -> Json<ToolsCatalogResponse> {
    Json(tools.aggregate(query.service_type).await.into())
}

/// GET /api/v1/health
///
/// Liveness of the registry API, independent of the tracked services.
pub async fn registry_health() -> Json<RegistryHealth> {
    Json(RegistryHealth {
        status: "healthy".to_owned(),
        service: SERVICE_NAME.to_owned(),
    })
}

/// GET /
pub async fn root_info(
    Extension(service): Extension<Arc<ServiceRegistryService>>,
    Extension(info): Extension<Arc<RegistryInfo>>,
) -> Json<RootInfo> {
    Json(RootInfo {
        service: SERVICE_NAME.to_owned(),
        version: info.version.clone(),
        status: "running".to_owned(),
        uptime_seconds: info.started_at.elapsed().as_secs_f64(),
        coordination_endpoints: info.coordination_endpoints.clone(),
        services_root_path: service.settings().root_path.clone(),
    })
}

/// GET /health
///
/// Process health: healthy only while the coordination backend is connected.
pub async fn process_health(
    Extension(service): Extension<Arc<ServiceRegistryService>>,
) -> Json<ProcessHealth> {
    let connected = service.is_connected();
    Json(ProcessHealth {
        status: if connected { "healthy" } else { "unhealthy" }.to_owned(),
        timestamp: Utc::now(),
        service: SERVICE_NAME.to_owned(),
        zookeeper_connected: connected,
        registered_services: service.service_count(),
    })
}
