//! Service Registry Module Implementation
//!
//! Keeps an in-memory cache of registered services synchronized with a
//! coordination backend, probes service health in the background, evicts
//! stale records and serves the registry REST API.
//! The public API is defined in `service-registry-sdk` and re-exported here.
//!
//! ## Architecture
//!
//! - **Ephemeral records**: one node per service under the services root; the
//!   backend drops them when the owning session ends
//! - **Watch reconciliation**: child-list changes in the backend are diffed
//!   against the cache
//! - **Concurrent probing**: each health-check cycle probes all services at once

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

// === PUBLIC API (from SDK) ===
pub use service_registry_sdk::{
    DiscoveryQuery, DiscoveryResponse, HealthCheck, RegistryStats, ServiceInfo, ServiceMetadata,
    ServiceRegistration, ServiceRegistryClientV1, ServiceRegistryError, ServiceStatus,
    ServiceType, ServiceUpdate,
};

// === MODULE DEFINITION ===
pub mod module;
pub use module::ServiceRegistryModule;

// === CONFIGURATION ===
pub mod config;

// === INTERNAL MODULES ===
#[doc(hidden)]
pub mod api;
#[doc(hidden)]
pub mod domain;
#[doc(hidden)]
pub mod infra;
pub mod local_client;
