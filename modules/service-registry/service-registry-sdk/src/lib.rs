//! Service Registry SDK
//!
//! This crate provides everything needed to consume the service registry:
//! - Service models (`ServiceInfo`, `ServiceRegistration`, `DiscoveryQuery`, ...)
//! - API trait (`ServiceRegistryClientV1`)
//! - Error type (`ServiceRegistryError`)
//! - HTTP client for a remote registry (`RegistryHttpClient`)
//! - Caching, load-balancing discovery helper with self-heartbeat (`DiscoveryClient`)
//!
//! ## Usage
//!
//! ```ignore
//! use service_registry_sdk::{DiscoveryClient, DiscoveryClientConfig, ServiceRegistration, ServiceType};
//!
//! let discovery = DiscoveryClient::connect(DiscoveryClientConfig::new("http://registry:3003"));
//! let id = discovery
//!     .register_service(ServiceRegistration::new("calc", ServiceType::Tool, "10.0.0.7", 9001))
//!     .await?;
//!
//! let url = discovery.get_healthy_service_url(Some(ServiceType::Tool), None, true).await?;
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

// === API TRAIT AND TYPES ===
mod api;
mod error;
pub mod models;

pub use api::ServiceRegistryClientV1;
pub use error::ServiceRegistryError;
pub use models::{
    DiscoveryQuery, DiscoveryResponse, HealthCheck, RegistryStats, ServiceInfo, ServiceMetadata,
    ServiceRegistration, ServiceStatus, ServiceType, ServiceUpdate,
};

// === CLIENTS ===
mod client;
mod discovery;

pub use client::RegistryHttpClient;
pub use discovery::{DiscoveryClient, DiscoveryClientConfig, ServiceCall};

/// Registry REST API prefix
pub const API_PREFIX: &str = "/api/v1";
