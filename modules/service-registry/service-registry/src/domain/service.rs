//! Service registry engine.
//!
//! The engine owns the in-memory cache of service records and keeps it in
//! sync with the coordination backend:
//!
//! - every record registered here is persisted as an ephemeral node named
//!   after its `service_id` under the services root;
//! - a child watch on the root reconciles records created or dropped by other
//!   registry instances;
//! - a background loop probes every service concurrently and stores status
//!   changes back to the backend;
//! - an optional sweep evicts records whose heartbeat is older than the TTL.
//!
//! Reads are served from the cache only. Cache map guards are never held
//! across an `.await`.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use service_registry_sdk::{
    DiscoveryQuery, DiscoveryResponse, HealthCheck, RegistryStats, ServiceInfo,
    ServiceRegistration, ServiceStatus, ServiceUpdate,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::DomainError;
use super::health::{HealthProber, ProbeOutcome};
use crate::infra::coordination::join_path;
use crate::infra::{ConnectionState, CoordinationClient, CoordinationError, CreateMode};

/// Runtime settings of the engine.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Namespace holding one node per service
    pub root_path: String,
    pub health_check_interval: Duration,
    /// Records whose last heartbeat is older than this are stale
    pub service_ttl: Duration,
    /// Period of the background stale sweep; `None` disables it
    pub cleanup_interval: Option<Duration>,
    /// Pause after a failed background step before it is retried
    pub retry_delay: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            root_path: "/services".to_owned(),
            health_check_interval: Duration::from_secs(30),
            service_ttl: Duration::from_secs(60),
            cleanup_interval: None,
            retry_delay: Duration::from_secs(5),
        }
    }
}

struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Registry engine; the single mutation point of the service cache.
pub struct ServiceRegistryService {
    coordination: CoordinationClient,
    prober: HealthProber,
    settings: RegistrySettings,
    pub(super) services: DashMap<String, ServiceInfo>,
    /// Round-robin position per service name
    pub(super) name_cursors: DashMap<String, usize>,
    /// Ids registered through this engine; their nodes are re-created after
    /// the session is lost
    owned: DashSet<String>,
    /// Ids whose node write is in flight; reconciliation leaves them alone
    pending: DashSet<String>,
    /// Ids unregistered here whose node may still be listed by the backend
    tombstones: DashSet<String>,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl std::fmt::Debug for ServiceRegistryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistryService")
            .field("settings", &self.settings)
            .field("services", &self.services.len())
            .field("coordination", &self.coordination)
            .finish_non_exhaustive()
    }
}

/// Order used for listings and round-robin selection.
fn registration_order(a: &ServiceInfo, b: &ServiceInfo) -> std::cmp::Ordering {
    a.registered_at
        .cmp(&b.registered_at)
        .then_with(|| a.service_id.cmp(&b.service_id))
}

fn validate_health_check(health_check: &HealthCheck) -> Result<(), DomainError> {
    if health_check.timeout_seconds == 0 {
        return Err(DomainError::validation(
            "health_check.timeout_seconds must be at least 1",
        ));
    }
    Ok(())
}

fn validate_registration(registration: &ServiceRegistration) -> Result<(), DomainError> {
    if registration.name.trim().is_empty() {
        return Err(DomainError::validation("name must not be empty"));
    }
    if registration.host.trim().is_empty() {
        return Err(DomainError::validation("host must not be empty"));
    }
    if let Some(health_check) = &registration.health_check {
        validate_health_check(health_check)?;
    }
    Ok(())
}

impl ServiceRegistryService {
    #[must_use]
    pub fn new(
        coordination: CoordinationClient,
        prober: HealthProber,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            coordination,
            prober,
            settings,
            services: DashMap::new(),
            name_cursors: DashMap::new(),
            owned: DashSet::new(),
            pending: DashSet::new(),
            tombstones: DashSet::new(),
            tasks: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    #[must_use]
    pub fn coordination(&self) -> &CoordinationClient {
        &self.coordination
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.coordination.is_connected()
    }

    /// Number of records in the cache
    #[must_use]
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    fn node_path(&self, service_id: &str) -> String {
        join_path(&self.settings.root_path, service_id)
    }

    // --- lifecycle ---

    /// Connect, load existing records and launch the background tasks.
    ///
    /// Calling `start` on a running engine is a no-op.
    ///
    /// # Errors
    /// Returns an error if the coordination backend is unreachable or the
    /// services root cannot be created or listed.
    pub async fn start(self: &Arc<Self>) -> Result<(), DomainError> {
        if self.tasks.lock().is_some() {
            return Ok(());
        }
        info!(root = %self.settings.root_path, "starting service registry");

        self.coordination.connect().await?;
        self.coordination
            .ensure_path(&self.settings.root_path)
            .await?;
        let loaded = self.load_existing().await?;
        info!(loaded, "loaded services from coordination backend");

        let cancel = CancellationToken::new();
        let mut handles = vec![
            tokio::spawn(Arc::clone(self).health_check_loop(cancel.clone())),
            tokio::spawn(Arc::clone(self).watch_loop(cancel.clone())),
            tokio::spawn(Arc::clone(self).connection_loop(cancel.clone())),
        ];
        if let Some(interval) = self.settings.cleanup_interval {
            handles.push(tokio::spawn(
                Arc::clone(self).cleanup_loop(interval, cancel.clone()),
            ));
        }
        *self.tasks.lock() = Some(BackgroundTasks { cancel, handles });

        info!("service registry started");
        Ok(())
    }

    /// Cancel and await the background tasks, then disconnect.
    ///
    /// Safe to call on an engine that never started or failed to start.
    pub async fn stop(&self) {
        info!("stopping service registry");
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.cancel.cancel();
            for handle in tasks.handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "registry background task failed");
                }
            }
        }
        if let Err(e) = self.coordination.disconnect().await {
            warn!(error = %e, "failed to disconnect from coordination backend");
        }
        info!("service registry stopped");
    }

    async fn fetch_record(&self, service_id: &str) -> Result<Option<ServiceInfo>, DomainError> {
        let Some(record) = self
            .coordination
            .get_node_data::<ServiceInfo>(&self.node_path(service_id))
            .await?
        else {
            return Ok(None);
        };
        if record.service_id != service_id {
            return Err(DomainError::validation(format!(
                "node '{service_id}' holds record '{}'",
                record.service_id
            )));
        }
        Ok(Some(record))
    }

    async fn load_existing(&self) -> Result<usize, DomainError> {
        let ids = self
            .coordination
            .get_children(&self.settings.root_path)
            .await?;
        let mut loaded = 0;
        for service_id in ids {
            match self.fetch_record(&service_id).await {
                Ok(Some(record)) => {
                    debug!(service_id = %service_id, name = %record.name, "loaded service");
                    self.services.insert(service_id, record);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(service_id = %service_id, error = %e, "skipping unreadable service record");
                }
            }
        }
        Ok(loaded)
    }

    // --- operations ---

    /// Register a service and probe it once before returning.
    ///
    /// # Errors
    /// Returns `Validation` for malformed registrations and
    /// `RegistrationFailed` if the record cannot be persisted.
    pub async fn register(
        &self,
        registration: ServiceRegistration,
    ) -> Result<String, DomainError> {
        validate_registration(&registration)?;

        let service_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = ServiceInfo {
            service_id: service_id.clone(),
            name: registration.name,
            service_type: registration.service_type,
            host: registration.host,
            port: registration.port,
            status: ServiceStatus::Starting,
            metadata: registration.metadata.unwrap_or_default(),
            health_check: registration.health_check.unwrap_or_default(),
            registered_at: now,
            last_heartbeat: now,
        };

        self.pending.insert(service_id.clone());
        self.services.insert(service_id.clone(), record.clone());
        let persisted = self
            .coordination
            .create_node(
                &self.node_path(&service_id),
                &record,
                CreateMode::Ephemeral,
            )
            .await;
        if let Err(e) = persisted {
            self.services.remove(&service_id);
            self.pending.remove(&service_id);
            error!(
                service_id = %service_id,
                name = %record.name,
                error = %e,
                "failed to persist service"
            );
            return Err(DomainError::registration_failed(e.to_string()));
        }
        self.owned.insert(service_id.clone());
        self.pending.remove(&service_id);

        info!(
            service_id = %service_id,
            name = %record.name,
            service_type = %record.service_type,
            url = %record.base_url(),
            "service registered"
        );

        if record.health_check.enabled {
            self.check_service(&record).await;
        }
        Ok(service_id)
    }

    /// Remove a service. Returns `false` if the id is unknown.
    ///
    /// Deleting the backend node is best-effort.
    pub async fn unregister(&self, service_id: &str) -> bool {
        self.tombstones.insert(service_id.to_owned());
        let Some((_, record)) = self.services.remove(service_id) else {
            self.tombstones.remove(service_id);
            return false;
        };
        self.forget(&record);

        if let Err(e) = self
            .coordination
            .delete_node(&self.node_path(service_id), false)
            .await
        {
            warn!(service_id = %service_id, error = %e, "failed to delete service node");
        }
        info!(service_id = %service_id, name = %record.name, "service unregistered");
        true
    }

    /// Apply the present fields of `update` and bump the heartbeat.
    ///
    /// Returns `Ok(false)` if the id is unknown.
    ///
    /// # Errors
    /// Returns `Validation` if the update would move the service back to
    /// `starting` or carries an invalid health-check policy.
    pub async fn update(
        &self,
        service_id: &str,
        update: ServiceUpdate,
    ) -> Result<bool, DomainError> {
        if let Some(health_check) = &update.health_check {
            validate_health_check(health_check)?;
        }

        let record = {
            let Some(mut entry) = self.services.get_mut(service_id) else {
                return Ok(false);
            };
            if update.status == Some(ServiceStatus::Starting)
                && entry.status != ServiceStatus::Starting
            {
                return Err(DomainError::validation(
                    "status 'starting' cannot be re-entered",
                ));
            }
            if let Some(status) = update.status {
                entry.status = status;
            }
            if let Some(metadata) = update.metadata {
                entry.metadata = metadata;
            }
            if let Some(health_check) = update.health_check {
                entry.health_check = health_check;
            }
            entry.last_heartbeat = Utc::now();
            entry.clone()
        };

        self.persist(&record).await;
        info!(service_id = %service_id, status = %record.status, "service updated");
        Ok(true)
    }

    /// Record a heartbeat. Returns `false` if the id is unknown.
    pub async fn heartbeat(&self, service_id: &str) -> bool {
        let record = {
            let Some(mut entry) = self.services.get_mut(service_id) else {
                return false;
            };
            entry.last_heartbeat = Utc::now();
            entry.clone()
        };
        self.persist(&record).await;
        debug!(service_id = %service_id, "heartbeat recorded");
        true
    }

    #[must_use]
    pub fn get_service(&self, service_id: &str) -> Option<ServiceInfo> {
        self.services.get(service_id).map(|e| e.value().clone())
    }

    /// Services named exactly `name`, taken in turn on successive calls.
    #[must_use]
    pub fn get_service_by_name(&self, name: &str) -> Option<ServiceInfo> {
        let mut candidates: Vec<ServiceInfo> = self
            .services
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.value().clone())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(registration_order);

        let index = {
            let mut cursor = self.name_cursors.entry(name.to_owned()).or_insert(0);
            let index = *cursor % candidates.len();
            *cursor = cursor.wrapping_add(1);
            index
        };
        Some(candidates.swap_remove(index))
    }

    /// Every cached record matching `query`, in registration order.
    #[must_use]
    pub fn discover(&self, query: DiscoveryQuery) -> DiscoveryResponse {
        let mut services: Vec<ServiceInfo> = self
            .services
            .iter()
            .filter(|e| query.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        services.sort_by(registration_order);
        DiscoveryResponse {
            total_count: services.len(),
            services,
            query,
        }
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut services_by_type = BTreeMap::new();
        let mut services_by_status = BTreeMap::new();
        for entry in &self.services {
            *services_by_type.entry(entry.service_type).or_insert(0) += 1;
            *services_by_status.entry(entry.status).or_insert(0) += 1;
        }
        let total_services = self.services.len();
        let healthy_services = services_by_status
            .get(&ServiceStatus::Healthy)
            .copied()
            .unwrap_or(0);
        RegistryStats {
            total_services,
            services_by_type,
            services_by_status,
            healthy_services,
            unhealthy_services: total_services - healthy_services,
        }
    }

    /// Unregister every service whose heartbeat is older than the TTL.
    ///
    /// Returns the number of evicted services.
    pub async fn cleanup_stale_services(&self) -> usize {
        let ttl = TimeDelta::from_std(self.settings.service_ttl).unwrap_or(TimeDelta::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.evict_older_than(cutoff).await
    }

    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let stale: Vec<String> = self
            .services
            .iter()
            .filter(|e| e.last_heartbeat < cutoff)
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for service_id in stale {
            if self.unregister(&service_id).await {
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, "cleaned up stale services");
        }
        evicted
    }

    // --- health checking ---

    /// Probe every service with health checking enabled, all at once.
    ///
    /// Returns the number of probed services.
    pub async fn perform_health_checks(&self) -> usize {
        let targets: Vec<ServiceInfo> = self
            .services
            .iter()
            .filter(|e| e.health_check.enabled)
            .map(|e| e.value().clone())
            .collect();

        let probes = targets
            .iter()
            .map(|service| AssertUnwindSafe(self.check_service(service)).catch_unwind());
        let results = join_all(probes).await;

        for (service, result) in targets.iter().zip(results) {
            if result.is_err() {
                error!(service_id = %service.service_id, "health probe panicked");
            }
        }
        targets.len()
    }

    async fn check_service(&self, snapshot: &ServiceInfo) {
        let outcome = self.prober.probe(snapshot).await;
        self.apply_probe(&snapshot.service_id, &outcome).await;
    }

    async fn apply_probe(&self, service_id: &str, outcome: &ProbeOutcome) {
        let next = outcome.status();
        let changed = {
            // Unregistered while the probe was in flight.
            let Some(mut entry) = self.services.get_mut(service_id) else {
                return;
            };
            if outcome.is_healthy() {
                entry.last_heartbeat = Utc::now();
            }
            if entry.status == next {
                None
            } else {
                let previous = entry.status;
                entry.status = next;
                Some((previous, entry.clone()))
            }
        };
        let Some((previous, record)) = changed else {
            return;
        };

        match outcome {
            ProbeOutcome::Healthy => {
                info!(
                    service_id = %service_id,
                    name = %record.name,
                    previous = %previous,
                    "service is healthy"
                );
            }
            ProbeOutcome::Unhealthy(reason) => {
                warn!(
                    service_id = %service_id,
                    name = %record.name,
                    previous = %previous,
                    reason = %reason,
                    "service is unhealthy"
                );
            }
        }
        self.persist(&record).await;
    }

    /// Best-effort write of a cached record; the cache stays authoritative.
    async fn persist(&self, record: &ServiceInfo) {
        if let Err(e) = self
            .coordination
            .update_node_data(&self.node_path(&record.service_id), record)
            .await
        {
            error!(service_id = %record.service_id, error = %e, "failed to persist service record");
        }
    }

    async fn health_check_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut delay = self.settings.health_check_interval;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                cycle = AssertUnwindSafe(self.perform_health_checks()).catch_unwind() => {
                    delay = if let Ok(probed) = cycle {
                        debug!(probed, "health-check cycle finished");
                        self.settings.health_check_interval
                    } else {
                        error!("health-check cycle panicked");
                        self.settings.retry_delay
                    };
                }
            }
        }
        debug!("health-check loop stopped");
    }

    async fn cleanup_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
            let evicted = self.cleanup_stale_services().await;
            debug!(evicted, "stale sweep finished");
        }
    }

    // --- coordination sync ---

    async fn watch_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            match self
                .coordination
                .watch_children(&self.settings.root_path)
                .await
            {
                Ok(mut children) => loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        next = children.next() => match next {
                            Some(ids) => self.reconcile(ids).await,
                            None => {
                                warn!("services watch ended");
                                break;
                            }
                        },
                    }
                },
                Err(e) => warn!(error = %e, "failed to watch services"),
            }
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.settings.retry_delay) => {}
            }
        }
    }

    /// Bring the cache in line with the backend's current child list.
    async fn reconcile(&self, children: Vec<String>) {
        let present: HashSet<String> = children.into_iter().collect();
        self.tombstones.retain(|id| present.contains(id));

        let missing: Vec<String> = self
            .services
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| !present.contains(id) && !self.pending.contains(id))
            .collect();
        for service_id in missing {
            self.reconcile_missing(&service_id).await;
        }

        for service_id in present {
            if self.services.contains_key(&service_id)
                || self.tombstones.contains(&service_id)
                || self.pending.contains(&service_id)
            {
                continue;
            }
            match self.fetch_record(&service_id).await {
                Ok(Some(record)) => {
                    info!(service_id = %service_id, name = %record.name, "service discovered");
                    self.services.entry(service_id.clone()).or_insert(record);
                    // Unregistered while the record was being fetched.
                    if self.tombstones.contains(&service_id) {
                        self.services.remove(&service_id);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(service_id = %service_id, error = %e, "skipping unreadable service record");
                }
            }
        }
    }

    async fn reconcile_missing(&self, service_id: &str) {
        // Child lists can be stale; confirm the node is really gone.
        let path = self.node_path(service_id);
        match self
            .coordination
            .get_node_data::<serde_json::Value>(&path)
            .await
        {
            Ok(None) => {}
            Ok(Some(_)) | Err(CoordinationError::Codec(_)) => return,
            Err(e) => {
                debug!(service_id = %service_id, error = %e, "could not confirm service removal");
                return;
            }
        }

        if let Some((_, record)) = self.services.remove(service_id) {
            self.forget(&record);
            info!(service_id = %service_id, name = %record.name, "service removed");
        }
    }

    /// Drop the bookkeeping kept for a record that left the cache.
    fn forget(&self, record: &ServiceInfo) {
        self.owned.remove(&record.service_id);
        self.name_cursors.remove_if(&record.name, |_, _| {
            !self.services.iter().any(|e| e.name == record.name)
        });
    }

    async fn restore(&self, record: &ServiceInfo) -> bool {
        let result = self
            .coordination
            .create_node(
                &self.node_path(&record.service_id),
                record,
                CreateMode::Ephemeral,
            )
            .await;
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(service_id = %record.service_id, error = %e, "failed to restore service node");
                false
            }
        }
    }

    async fn connection_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut states = self.coordination.connection_states();
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = states.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            let state = *states.borrow_and_update();
            match state {
                ConnectionState::Connected => info!("coordination session connected"),
                ConnectionState::Suspended => {
                    warn!("coordination session suspended, serving reads from cache");
                }
                ConnectionState::Lost => {
                    error!("coordination session lost");
                    self.recover_session(&cancel).await;
                }
                ConnectionState::Closed => debug!("coordination session closed"),
            }
        }
    }

    /// Reconnect after session loss and re-create the nodes owned here.
    async fn recover_session(&self, cancel: &CancellationToken) {
        // Keep reconciliation from dropping owned records whose nodes went
        // with the old session.
        let owned_ids: Vec<String> = self.owned.iter().map(|id| id.key().clone()).collect();
        for id in &owned_ids {
            self.pending.insert(id.clone());
        }
        self.reconnect_and_restore(cancel).await;
        for id in &owned_ids {
            self.pending.remove(id);
        }
    }

    async fn reconnect_and_restore(&self, cancel: &CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.settings.retry_delay) => {}
            }
            let reconnected = async {
                self.coordination.connect().await?;
                self.coordination
                    .ensure_path(&self.settings.root_path)
                    .await
            }
            .await;
            if let Err(e) = reconnected {
                warn!(error = %e, "failed to re-establish coordination session");
                continue;
            }

            let owned: Vec<ServiceInfo> = self
                .owned
                .iter()
                .filter_map(|id| self.get_service(id.key()))
                .collect();
            let mut restored = 0;
            for record in &owned {
                if self.restore(record).await {
                    restored += 1;
                }
            }
            info!(restored, "coordination session re-established");
            return;
        }
    }
}
