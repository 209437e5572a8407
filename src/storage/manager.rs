/// Storage manager
///
/// Composition root for the storage side: builds the configured backends,
/// owns the registry, the failover coordinator and the periodic health loop,
/// and exposes the caller-facing operations. Every operation other than
/// `initialize` fails with `NotInitialized` until initialization succeeds.
use super::failover::{FailoverCoordinator, FailoverDownload, FailoverReport, FailoverUpload};
use super::registry::{BackendRegistry, FailoverPolicy};
use crate::backends::{
    BackendKind, BackendStats, CloudBackend, HealthStatus, LocalBackend, ObjectInfo,
    StorageBackend, UploadOptions, UploadOutcome,
};
use crate::config::{StorageSettings, CLOUD_BACKEND, LOCAL_BACKEND};
use crate::metrics::{MetricsRegistry, MetricsSummary, OperationKind};
use crate::{StorageError, StorageResult};
use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Stats for one backend; a backend whose stats call failed still appears
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatsReport {
    pub kind: BackendKind,
    pub stats: Option<BackendStats>,
    pub error: Option<String>,
    pub metrics: Option<MetricsSummary>,
}

struct Core {
    registry: Arc<BackendRegistry>,
    coordinator: FailoverCoordinator,
    metrics: Arc<MetricsRegistry>,
    health: Mutex<BTreeMap<String, HealthStatus>>,
}

impl Core {
    async fn check_all(&self, timeout: Duration) -> BTreeMap<String, HealthStatus> {
        let checks = self.registry.all().into_iter().map(|backend| async move {
            let name = backend.descriptor().name;
            let started = Instant::now();
            let status = match tokio::time::timeout(timeout, backend.health_check()).await {
                Ok(status) => status,
                Err(_) => HealthStatus::unhealthy(format!(
                    "health check timed out after {}ms",
                    timeout.as_millis()
                )),
            };
            self.metrics.record(
                &name,
                OperationKind::HealthCheck,
                started.elapsed(),
                0,
                status.healthy,
            );
            (name, status)
        });

        let results: BTreeMap<String, HealthStatus> = join_all(checks).await.into_iter().collect();

        for (name, status) in &results {
            if !status.healthy {
                tracing::warn!(
                    backend = %name,
                    error = status.error.as_deref().unwrap_or("unknown"),
                    "Backend health check failed"
                );
            }
        }

        let mut snapshot = self.health.lock().unwrap();
        snapshot.extend(results.clone());
        results
    }
}

pub struct StorageManager {
    settings: StorageSettings,
    injected: Mutex<Option<Vec<Arc<dyn StorageBackend>>>>,
    core: OnceLock<Arc<Core>>,
    init_lock: tokio::sync::Mutex<()>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl StorageManager {
    /// Manager that builds its backends from `settings` on `initialize`
    pub fn new(settings: StorageSettings) -> StorageResult<Self> {
        settings.validate()?;
        Ok(Self::build(settings, None))
    }

    /// Manager over pre-built backends (custom backends, tests)
    pub fn with_backends(
        settings: StorageSettings,
        backends: Vec<Arc<dyn StorageBackend>>,
    ) -> StorageResult<Self> {
        settings.validate_limits()?;
        Ok(Self::build(settings, Some(backends)))
    }

    fn build(settings: StorageSettings, injected: Option<Vec<Arc<dyn StorageBackend>>>) -> Self {
        Self {
            settings,
            injected: Mutex::new(injected),
            core: OnceLock::new(),
            init_lock: tokio::sync::Mutex::new(()),
            health_task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    pub fn is_initialized(&self) -> bool {
        self.core.get().is_some()
    }

    /// Build backends and start the health loop. Repeated calls are no-ops.
    ///
    /// A backend that cannot be constructed is logged and left out; only an
    /// empty registry is an error.
    pub async fn initialize(&self) -> StorageResult<()> {
        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        let injected = self.injected.lock().unwrap().take();
        let backends = match injected {
            Some(backends) => backends,
            None => self.construct_backends(),
        };

        if backends.is_empty() {
            tracing::error!("No storage backends could be initialized");
            return Err(StorageError::NoBackendsAvailable);
        }

        let mut registry = BackendRegistry::new(
            FailoverPolicy::from(&self.settings.failover),
            &self.settings.primary,
            &self.settings.fallbacks,
        );
        for backend in backends {
            registry.register(backend);
        }

        let registry = Arc::new(registry);
        let metrics = Arc::new(MetricsRegistry::new(
            self.settings.metrics.max_retained_results,
        ));
        let core = Arc::new(Core {
            coordinator: FailoverCoordinator::new(registry.clone(), metrics.clone()),
            registry: registry.clone(),
            metrics,
            health: Mutex::new(BTreeMap::new()),
        });

        if self.core.set(core.clone()).is_err() {
            return Ok(());
        }

        if self.settings.health.enabled {
            self.start_health_loop(core);
        }

        let names: Vec<String> = registry.descriptors().into_iter().map(|d| d.name).collect();
        tracing::info!(
            backends = ?names,
            primary = %registry.primary(),
            "Storage manager initialized"
        );
        Ok(())
    }

    fn construct_backends(&self) -> Vec<Arc<dyn StorageBackend>> {
        let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::new();

        for name in self.settings.backend_order() {
            match name.as_str() {
                CLOUD_BACKEND => {
                    match CloudBackend::new(&self.settings.cloud, &self.settings.uploads) {
                        Ok(backend) => backends.push(Arc::new(backend)),
                        Err(e) => {
                            tracing::warn!(error = %e, "Cloud backend disabled");
                        }
                    }
                }
                LOCAL_BACKEND => {
                    if !self.settings.local.enabled {
                        tracing::info!("Local backend disabled by configuration");
                        continue;
                    }
                    match LocalBackend::new(&self.settings.local, &self.settings.uploads) {
                        Ok(backend) => backends.push(Arc::new(backend)),
                        Err(e) => {
                            tracing::warn!(
                                base_path = %self.settings.local.base_path.display(),
                                error = %e,
                                "Local backend disabled"
                            );
                        }
                    }
                }
                other => tracing::warn!(backend = other, "Ignoring unknown backend name"),
            }
        }

        backends
    }

    fn start_health_loop(&self, core: Arc<Core>) {
        let interval = self.settings.health.interval();
        let timeout = self.settings.health.timeout();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let results = core.check_all(timeout).await;
                let healthy = results.values().filter(|s| s.healthy).count();
                tracing::debug!(healthy, total = results.len(), "Periodic health check finished");
            }
        });

        *self.health_task.lock().unwrap() = Some(handle);
        tracing::debug!(
            interval = %humantime::format_duration(interval),
            "Health check loop started"
        );
    }

    fn core(&self) -> StorageResult<&Arc<Core>> {
        self.core.get().ok_or(StorageError::NotInitialized)
    }

    pub async fn upload_with_fallback(
        &self,
        data: Bytes,
        filename: &str,
        options: &UploadOptions,
    ) -> StorageResult<FailoverUpload> {
        self.core()?
            .coordinator
            .upload_with_fallback(data, filename, options)
            .await
    }

    /// Upload to one named backend, bypassing failover
    ///
    /// The outcome is still recorded against the backend's failover state.
    pub async fn upload_with_backend(
        &self,
        backend_name: &str,
        data: Bytes,
        filename: &str,
        options: &UploadOptions,
    ) -> StorageResult<UploadOutcome> {
        let core = self.core()?;
        let backend = core
            .registry
            .get(backend_name)
            .ok_or_else(|| StorageError::UnknownBackend(backend_name.to_string()))?;

        if !core.registry.is_available(backend_name) {
            return Err(StorageError::BackendUnavailable(backend_name.to_string()));
        }

        let size_bytes = data.len() as u64;
        let started = Instant::now();
        let outcome = backend.upload(data, filename, options).await;
        core.metrics.record(
            backend_name,
            OperationKind::Upload,
            started.elapsed(),
            size_bytes,
            outcome.success,
        );

        if outcome.success {
            core.registry.record_success(backend_name);
        } else {
            let message = outcome
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "upload failed".to_string());
            core.registry.record_failure(backend_name, &message);
        }

        Ok(outcome)
    }

    pub async fn download_with_fallback(&self, key: &str) -> StorageResult<FailoverDownload> {
        self.core()?.coordinator.download_with_fallback(key).await
    }

    /// Remove `key` from every available backend holding it
    ///
    /// Returns whether anything was removed. Fails only when no backend
    /// could be asked.
    pub async fn delete(&self, key: &str) -> StorageResult<bool> {
        let core = self.core()?;
        let mut removed = false;
        let mut last_error = None;
        let mut reachable = 0;

        for backend in core.registry.all() {
            let name = backend.descriptor().name;
            if !core.registry.is_available(&name) {
                continue;
            }

            let started = Instant::now();
            match backend.delete(key).await {
                Ok(()) => {
                    reachable += 1;
                    removed = true;
                    core.metrics
                        .record(&name, OperationKind::Delete, started.elapsed(), 0, true);
                    tracing::debug!(backend = %name, key, "Deleted object");
                }
                Err(e) if e.is_not_found() => reachable += 1,
                Err(e) => {
                    core.metrics
                        .record(&name, OperationKind::Delete, started.elapsed(), 0, false);
                    tracing::warn!(backend = %name, key, error = %e, "Delete failed");
                    core.registry.record_failure(&name, &e.to_string());
                    last_error = Some(e);
                }
            }
        }

        match (reachable, last_error) {
            (0, Some(e)) => Err(e),
            (0, None) => Err(StorageError::NoBackendsAvailable),
            _ => Ok(removed),
        }
    }

    /// True when any available backend holds `key`
    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        let core = self.core()?;
        let backends = core.registry.available_backends_by_priority();
        if backends.is_empty() {
            return Err(StorageError::NoBackendsAvailable);
        }

        let mut last_error = None;
        let mut answered = false;
        for backend in backends {
            match backend.exists(key).await {
                Ok(true) => return Ok(true),
                Ok(false) => answered = true,
                Err(e) => {
                    tracing::debug!(backend = %backend.descriptor().name, error = %e, "Exists check failed");
                    last_error = Some(e);
                }
            }
        }

        match (answered, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(false),
        }
    }

    /// Object description from the first available backend holding `key`
    pub async fn object_info(&self, key: &str) -> StorageResult<ObjectInfo> {
        let core = self.core()?;
        let mut last_error = None;

        for backend in core.registry.available_backends_by_priority() {
            match backend.object_info(key).await {
                Ok(info) => return Ok(info),
                Err(e) if e.is_not_found() => {}
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        }))
    }

    /// Public URL of `key` on the given backend (primary when `None`)
    pub fn get_url(&self, key: &str, backend_name: Option<&str>) -> StorageResult<String> {
        let core = self.core()?;
        let backend = match backend_name {
            Some(name) => core
                .registry
                .get(name)
                .ok_or_else(|| StorageError::UnknownBackend(name.to_string()))?,
            // The configured primary may have been skipped at initialization
            None => core
                .registry
                .available_backends_by_priority()
                .into_iter()
                .next()
                .or_else(|| core.registry.all().into_iter().next())
                .ok_or(StorageError::NoBackendsAvailable)?,
        };
        Ok(backend.get_url(key))
    }

    /// Health-check every backend concurrently, each bounded by the configured timeout
    pub async fn perform_health_check(&self) -> StorageResult<BTreeMap<String, HealthStatus>> {
        let core = self.core()?;
        Ok(core.check_all(self.settings.health.timeout()).await)
    }

    /// Most recent health results without running new checks
    pub fn last_health(&self) -> StorageResult<BTreeMap<String, HealthStatus>> {
        Ok(self.core()?.health.lock().unwrap().clone())
    }

    pub async fn get_all_stats(&self) -> StorageResult<BTreeMap<String, BackendStatsReport>> {
        let core = self.core()?;
        let mut report = BTreeMap::new();

        for backend in core.registry.all() {
            let descriptor = backend.descriptor();
            let (stats, error) = match backend.get_stats().await {
                Ok(stats) => (Some(stats), None),
                Err(e) => {
                    tracing::warn!(backend = %descriptor.name, error = %e, "Stats unavailable");
                    (None, Some(e.to_string()))
                }
            };
            report.insert(
                descriptor.name.clone(),
                BackendStatsReport {
                    kind: descriptor.kind,
                    stats,
                    error,
                    metrics: core.metrics.summary(&descriptor.name),
                },
            );
        }

        Ok(report)
    }

    pub fn get_failover_report(&self) -> StorageResult<FailoverReport> {
        let core = self.core()?;
        let health = core.health.lock().unwrap().clone();
        Ok(core.coordinator.report(&health))
    }

    pub fn switch_primary(&self, backend_name: &str) -> StorageResult<()> {
        self.core()?.registry.set_primary(backend_name)
    }

    /// Clear a backend's failover state and its operation history
    pub fn reset_backend(&self, backend_name: &str) -> StorageResult<()> {
        let core = self.core()?;
        core.registry.reset(backend_name)?;
        core.metrics.reset(backend_name);
        Ok(())
    }

    pub fn reset_all_backends(&self) -> StorageResult<()> {
        let core = self.core()?;
        core.registry.reset_all();
        core.metrics.reset_all();
        Ok(())
    }

    /// Stop the health loop. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if let Some(handle) = self.health_task.lock().unwrap().take() {
            handle.abort();
            tracing::info!("Storage manager shut down");
        }
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
