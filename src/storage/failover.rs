/// Sequential, priority-ordered failover across backends
///
/// Backends are tried one at a time, never concurrently, so a logical upload
/// is written at most once. The first success wins; each failure is recorded
/// against that backend's failover state before moving on.
use super::registry::BackendRegistry;
use crate::backends::{BackendKind, DownloadedObject, HealthStatus, UploadOptions, UploadOutcome};
use crate::metrics::{MetricsRegistry, OperationKind};
use crate::recovery::classification::{ErrorKind, ErrorReport};
use crate::{StorageError, StorageResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Successful upload plus where and how it landed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverUpload {
    #[serde(flatten)]
    pub outcome: UploadOutcome,
    pub backend_used: String,
    #[serde(serialize_with = "serialize_millis", rename = "elapsedMs")]
    pub elapsed: Duration,
    /// Backends tried, including the one that succeeded
    pub attempts: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailoverDownload {
    pub object: DownloadedObject,
    pub backend_used: String,
    pub elapsed: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendReport {
    pub name: String,
    pub kind: BackendKind,
    pub available: bool,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub blacklisted: bool,
    pub blacklist_remaining_ms: Option<u64>,
    pub last_error: Option<String>,
    pub health: Option<HealthStatus>,
}

/// Operator view of the failover configuration and state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverReport {
    pub primary: String,
    pub fallbacks: Vec<String>,
    pub backends: Vec<BackendReport>,
    pub generated_at: DateTime<Utc>,
}

pub struct FailoverCoordinator {
    registry: Arc<BackendRegistry>,
    metrics: Arc<MetricsRegistry>,
}

impl FailoverCoordinator {
    pub fn new(registry: Arc<BackendRegistry>, metrics: Arc<MetricsRegistry>) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Upload to the first backend that accepts the data
    pub async fn upload_with_fallback(
        &self,
        data: Bytes,
        filename: &str,
        options: &UploadOptions,
    ) -> StorageResult<FailoverUpload> {
        let backends = self.registry.available_backends_by_priority();
        if backends.is_empty() {
            tracing::error!(filename, "No storage backends available for upload");
            return Err(StorageError::NoBackendsAvailable);
        }

        let started = Instant::now();
        let size_bytes = data.len() as u64;
        let mut last_report: Option<ErrorReport> = None;

        for (index, backend) in backends.iter().enumerate() {
            let name = backend.descriptor().name;
            let attempt_started = Instant::now();

            let outcome = backend.upload(data.clone(), filename, options).await;
            self.metrics.record(
                &name,
                OperationKind::Upload,
                attempt_started.elapsed(),
                size_bytes,
                outcome.success,
            );

            if outcome.success {
                self.registry.record_success(&name);
                if index > 0 {
                    tracing::info!(
                        backend = %name,
                        attempts = index + 1,
                        "Upload succeeded on fallback backend"
                    );
                }
                return Ok(FailoverUpload {
                    outcome,
                    backend_used: name,
                    elapsed: started.elapsed(),
                    attempts: index + 1,
                });
            }

            let report = outcome
                .error
                .clone()
                .unwrap_or_else(|| outcome.to_error().report());
            tracing::warn!(
                backend = %name,
                kind = %report.kind,
                error = %report.message,
                "Upload failed, trying next backend"
            );
            self.registry.record_failure(&name, &report.message);
            last_report = Some(report);
        }

        let report = last_report.unwrap_or(ErrorReport {
            kind: ErrorKind::Unknown,
            message: "upload failed".to_string(),
        });
        tracing::error!(
            filename,
            attempts = backends.len(),
            error = %report.message,
            "All storage backends failed"
        );
        Err(StorageError::AllBackendsFailed {
            attempts: backends.len(),
            last_error: report.message,
            last_kind: report.kind,
        })
    }

    /// Read `key` from the first available backend that has it
    ///
    /// A backend answering `NotFound` is healthy and is not penalised.
    pub async fn download_with_fallback(&self, key: &str) -> StorageResult<FailoverDownload> {
        let backends = self.registry.available_backends_by_priority();
        if backends.is_empty() {
            return Err(StorageError::NoBackendsAvailable);
        }

        let started = Instant::now();
        let mut last_error: Option<StorageError> = None;

        for backend in &backends {
            let name = backend.descriptor().name;
            let attempt_started = Instant::now();

            match backend.download(key).await {
                Ok(object) => {
                    self.metrics.record(
                        &name,
                        OperationKind::Download,
                        attempt_started.elapsed(),
                        object.size_bytes,
                        true,
                    );
                    self.registry.record_success(&name);
                    return Ok(FailoverDownload {
                        object,
                        backend_used: name,
                        elapsed: started.elapsed(),
                    });
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!(backend = %name, key, "Object not on this backend");
                }
                Err(e) => {
                    self.metrics.record(
                        &name,
                        OperationKind::Download,
                        attempt_started.elapsed(),
                        0,
                        false,
                    );
                    tracing::warn!(backend = %name, key, error = %e, "Download failed");
                    self.registry.record_failure(&name, &e.to_string());
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            None => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Some(e) => Err(StorageError::AllBackendsFailed {
                attempts: backends.len(),
                last_kind: e.kind(),
                last_error: e.to_string(),
            }),
        }
    }

    pub fn report(&self, health: &BTreeMap<String, HealthStatus>) -> FailoverReport {
        let backends = self
            .registry
            .descriptors()
            .into_iter()
            .map(|descriptor| {
                let available = self.registry.is_available(&descriptor.name);
                let state = self.registry.state(&descriptor.name);
                BackendReport {
                    available,
                    failure_count: state.as_ref().map_or(0, |s| s.failure_count),
                    last_failure_at: state.as_ref().and_then(|s| s.last_failure_at),
                    blacklisted: state.as_ref().is_some_and(|s| s.is_blacklisted),
                    blacklist_remaining_ms: state
                        .as_ref()
                        .and_then(|s| s.blacklist_remaining())
                        .map(|d| d.as_millis() as u64),
                    last_error: state.and_then(|s| s.last_error),
                    health: health.get(&descriptor.name).cloned(),
                    kind: descriptor.kind,
                    name: descriptor.name,
                }
            })
            .collect();

        FailoverReport {
            primary: self.registry.primary(),
            fallbacks: self.registry.fallbacks(),
            backends,
            generated_at: Utc::now(),
        }
    }
}
