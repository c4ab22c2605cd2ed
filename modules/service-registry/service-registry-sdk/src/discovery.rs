//! Client-side discovery helper.
//!
//! Wraps any [`ServiceRegistryClientV1`] with a short-lived read-through cache
//! for discovery queries, random load balancing across healthy instances, a
//! background self-heartbeat, and a convenience for calling resolved services.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use registry_http::{HttpClient, HttpResponse, Method};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::ServiceRegistryClientV1;
use crate::client::RegistryHttpClient;
use crate::error::ServiceRegistryError;
use crate::models::{
    DiscoveryQuery, ServiceInfo, ServiceRegistration, ServiceStatus, ServiceType,
};

/// Pause after a failed heartbeat before the next attempt
const HEARTBEAT_RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Settings of a [`DiscoveryClient`].
#[derive(Debug, Clone)]
pub struct DiscoveryClientConfig {
    pub registry_url: String,
    pub request_timeout: Duration,
    pub cache_ttl: Duration,
    pub heartbeat_interval: Duration,
}

impl DiscoveryClientConfig {
    #[must_use]
    pub fn new(registry_url: impl Into<String>) -> Self {
        Self {
            registry_url: registry_url.into(),
            request_timeout: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// A call against a resolved service instance.
#[derive(Debug, Clone)]
pub struct ServiceCall {
    method: Method,
    body: Option<serde_json::Value>,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
}

impl Default for ServiceCall {
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl ServiceCall {
    #[must_use]
    pub fn new(method: Method) -> Self {
        Self {
            method,
            body: None,
            query: Vec::new(),
            headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

struct CacheEntry {
    services: Vec<ServiceInfo>,
    fetched_at: Instant,
}

struct HeartbeatTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Caching, load-balancing discovery client.
pub struct DiscoveryClient {
    registry: Arc<dyn ServiceRegistryClientV1>,
    http: HttpClient,
    config: DiscoveryClientConfig,
    service_id: Mutex<Option<String>>,
    cache: DashMap<String, CacheEntry>,
    heartbeat_task: Mutex<Option<HeartbeatTask>>,
}

impl DiscoveryClient {
    /// Client talking to a remote registry over HTTP.
    #[must_use]
    pub fn connect(config: DiscoveryClientConfig) -> Self {
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build();
        let registry = Arc::new(RegistryHttpClient::new(http.clone(), &config.registry_url));
        Self::with_registry(registry, http, config)
    }

    /// Client over an arbitrary registry implementation (e.g. an in-process one).
    #[must_use]
    pub fn with_registry(
        registry: Arc<dyn ServiceRegistryClientV1>,
        http: HttpClient,
        config: DiscoveryClientConfig,
    ) -> Self {
        Self {
            registry,
            http,
            config,
            service_id: Mutex::new(None),
            cache: DashMap::new(),
            heartbeat_task: Mutex::new(None),
        }
    }

    /// Id of the service this client registered, if any.
    #[must_use]
    pub fn service_id(&self) -> Option<String> {
        self.service_id.lock().clone()
    }

    /// Register this process and start the heartbeat task.
    ///
    /// # Errors
    /// Returns the registry error if registration fails.
    pub async fn register_service(
        &self,
        registration: ServiceRegistration,
    ) -> Result<String, ServiceRegistryError> {
        let service_id = self.registry.register_service(registration).await?;
        *self.service_id.lock() = Some(service_id.clone());
        self.start_heartbeat(service_id.clone());
        Ok(service_id)
    }

    /// Stop heartbeating and unregister this process.
    ///
    /// Returns `false` if nothing was registered or the registry call failed.
    pub async fn unregister_service(&self) -> bool {
        self.stop_heartbeat().await;

        let Some(service_id) = self.service_id() else {
            return false;
        };

        match self.registry.unregister_service(&service_id).await {
            Ok(found) => {
                *self.service_id.lock() = None;
                found
            }
            Err(e) => {
                tracing::warn!(service_id = %service_id, error = %e, "unregister failed");
                false
            }
        }
    }

    /// Services matching `query`, served from cache while the entry is fresh.
    ///
    /// # Errors
    /// Returns the registry error if the lookup fails.
    pub async fn discover_services(
        &self,
        query: DiscoveryQuery,
        use_cache: bool,
    ) -> Result<Vec<ServiceInfo>, ServiceRegistryError> {
        let key = cache_key(&query);

        if use_cache
            && let Some(entry) = self.cache.get(&key)
            && entry.fetched_at.elapsed() < self.config.cache_ttl
        {
            return Ok(entry.services.clone());
        }

        let response = self.registry.discover_services(query).await?;

        if use_cache {
            self.cache.insert(
                key,
                CacheEntry {
                    services: response.services.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }

        Ok(response.services)
    }

    /// Lookup by exact name; any failure yields `None`.
    pub async fn get_service_by_name(&self, name: &str) -> Option<ServiceInfo> {
        match self.registry.get_service_by_name(name).await {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!(name, error = %e, "lookup by name failed");
                None
            }
        }
    }

    /// Base URL of a healthy instance.
    ///
    /// With `load_balance` an instance is picked at random among all matches,
    /// otherwise the first match wins.
    ///
    /// # Errors
    /// Returns the registry error if discovery fails.
    pub async fn get_healthy_service_url(
        &self,
        service_type: Option<ServiceType>,
        name: Option<&str>,
        load_balance: bool,
    ) -> Result<Option<String>, ServiceRegistryError> {
        let query = DiscoveryQuery {
            service_type,
            name: name.map(str::to_owned),
            status: Some(ServiceStatus::Healthy),
            ..DiscoveryQuery::default()
        };
        let services = self.discover_services(query, true).await?;

        let chosen = if load_balance && services.len() > 1 {
            services.choose(&mut rand::rng())
        } else {
            services.first()
        };

        Ok(chosen.map(ServiceInfo::base_url))
    }

    /// Resolve a healthy instance of `service_name` and call `endpoint` on it.
    ///
    /// # Errors
    /// - `ServiceUnavailable` if no healthy instance resolves
    /// - `Upstream` if the service answers with a non-2xx status
    /// - `Transport` on network failure
    pub async fn call_service(
        &self,
        service_name: &str,
        endpoint: &str,
        call: ServiceCall,
    ) -> Result<HttpResponse, ServiceRegistryError> {
        let Some(base_url) = self
            .get_healthy_service_url(None, Some(service_name), true)
            .await?
        else {
            return Err(ServiceRegistryError::unavailable(service_name));
        };

        let url = format!("{base_url}{endpoint}");
        let mut request = self
            .http
            .request(call.method, &url)
            .query(&call.query)
            .headers(call.headers);
        if let Some(body) = &call.body {
            request = request.json(body)?;
        }

        let response = request.send().await?.error_for_status()?;
        Ok(response)
    }

    /// Send one heartbeat for the registered service.
    pub async fn heartbeat(&self) -> bool {
        let Some(service_id) = self.service_id() else {
            return false;
        };
        send_heartbeat(self.registry.as_ref(), &service_id).await
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Stop background work. Registration is left in place.
    pub async fn close(&self) {
        self.stop_heartbeat().await;
    }

    fn start_heartbeat(&self, service_id: String) {
        let mut slot = self.heartbeat_task.lock();
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let registry = Arc::clone(&self.registry);
        let interval = self.config.heartbeat_interval;
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            heartbeat_loop(registry, service_id, interval, token).await;
        });

        *slot = Some(HeartbeatTask { cancel, handle });
    }

    async fn stop_heartbeat(&self) {
        let task = self.heartbeat_task.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                tracing::warn!(error = %e, "heartbeat task ended abnormally");
            }
        }
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat_task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

async fn send_heartbeat(registry: &dyn ServiceRegistryClientV1, service_id: &str) -> bool {
    match registry.heartbeat(service_id).await {
        Ok(true) => true,
        Ok(false) => {
            tracing::warn!(service_id, "heartbeat rejected: service unknown to registry");
            false
        }
        Err(e) => {
            tracing::warn!(service_id, error = %e, "heartbeat failed");
            false
        }
    }
}

async fn heartbeat_loop(
    registry: Arc<dyn ServiceRegistryClientV1>,
    service_id: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::debug!(service_id = %service_id, "heartbeat loop started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }

        if !send_heartbeat(registry.as_ref(), &service_id).await {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(HEARTBEAT_RETRY_PAUSE) => {}
            }
        }
    }
    tracing::debug!(service_id = %service_id, "heartbeat loop stopped");
}

/// Canonical cache key; filter lists are order-insensitive.
fn cache_key(query: &DiscoveryQuery) -> String {
    let mut normalized = query.clone();
    if let Some(tags) = normalized.tags.as_mut() {
        tags.sort();
    }
    if let Some(capabilities) = normalized.capabilities.as_mut() {
        capabilities.sort();
    }
    serde_json::to_string(&normalized).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_ignores_filter_order() {
        let a = DiscoveryQuery::default().with_tags(["x", "y"]);
        let b = DiscoveryQuery::default().with_tags(["y", "x"]);
        let c = DiscoveryQuery::default().with_tags(["x"]);

        assert_eq!(cache_key(&a), cache_key(&b));
        assert_ne!(cache_key(&a), cache_key(&c));
    }
}
