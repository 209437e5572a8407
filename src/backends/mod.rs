/// Storage backend contract
///
/// Every backend (cloud object storage, local filesystem) implements
/// `StorageBackend`. Backends surface upload failures as an `UploadOutcome`
/// with `success == false` so the failover coordinator can inspect them and
/// move on; the other operations return `StorageResult`.
use crate::recovery::classification::ErrorReport;
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub mod cloud;
pub mod keys;
pub mod local;

pub use cloud::CloudBackend;
pub use local::LocalBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cloud,
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cloud => write!(f, "cloud"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

/// Immutable identity of a backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub kind: BackendKind,
}

impl BackendDescriptor {
    pub fn new(name: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Per-upload options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadOptions {
    /// Exact key to write; generated from the filename when absent
    pub key: Option<String>,
    /// Prefix for generated keys; the backend default when absent
    pub prefix: Option<String>,
    /// Detected from the filename extension when absent
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub cache_control: Option<String>,
}

impl UploadOptions {
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Key to write: explicit key or a freshly generated one
    pub fn resolve_key(&self, default_prefix: &str, filename: &str) -> StorageResult<String> {
        let key = match &self.key {
            Some(key) => key.trim_start_matches('/').to_string(),
            None => keys::generate_key(
                self.prefix.as_deref().unwrap_or(default_prefix),
                filename,
            ),
        };
        keys::validate_key(&key)?;
        Ok(key)
    }

    pub fn resolve_content_type(&self, filename: &str) -> String {
        self.content_type
            .clone()
            .unwrap_or_else(|| keys::detect_content_type(filename))
    }
}

/// Result of one upload attempt against one backend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub success: bool,
    pub key: String,
    pub url: String,
    pub cdn_url: Option<String>,
    pub size_bytes: u64,
    pub etag: Option<String>,
    pub metadata: HashMap<String, String>,
    pub error: Option<ErrorReport>,
    pub uploaded_at: DateTime<Utc>,
}

impl UploadOutcome {
    /// Failed attempt carrying the classified error
    pub fn failed(key: impl Into<String>, size_bytes: u64, error: &StorageError) -> Self {
        Self {
            success: false,
            key: key.into(),
            url: String::new(),
            cdn_url: None,
            size_bytes,
            etag: None,
            metadata: HashMap::new(),
            error: Some(error.report()),
            uploaded_at: Utc::now(),
        }
    }

    /// Rebuild an error from a failed outcome
    pub fn to_error(&self) -> StorageError {
        match &self.error {
            Some(report) => StorageError::Upload(report.message.clone()),
            None => StorageError::Upload(format!("upload of {} failed", self.key)),
        }
    }
}

/// Object body plus what is known about it
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedObject {
    pub bytes: Bytes,
    pub content_type: String,
    pub size_bytes: u64,
    pub last_modified_at: DateTime<Utc>,
    pub etag: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Object description without the body
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub key: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub last_modified_at: DateTime<Utc>,
    pub etag: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Point-in-time reachability snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub last_check_at: DateTime<Utc>,
    pub details: HashMap<String, String>,
}

impl HealthStatus {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms: Some(latency_ms),
            error: None,
            last_check_at: Utc::now(),
            details: HashMap::new(),
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: None,
            error: Some(error.into()),
            last_check_at: Utc::now(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStats {
    pub total_files: u64,
    pub total_size_bytes: u64,
    pub available_space_bytes: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn descriptor(&self) -> BackendDescriptor;

    /// Write `data` under a key derived from `filename` and `options`.
    /// Failures are reported in the outcome, never as `Err`.
    async fn upload(&self, data: Bytes, filename: &str, options: &UploadOptions) -> UploadOutcome;

    /// Fails with `NotFound` when the key is absent
    async fn download(&self, key: &str) -> StorageResult<DownloadedObject>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    async fn object_info(&self, key: &str) -> StorageResult<ObjectInfo>;

    fn get_url(&self, key: &str) -> String;

    fn get_cdn_url(&self, key: &str) -> Option<String>;

    /// One cheap round trip; never fails, problems become `healthy == false`
    async fn health_check(&self) -> HealthStatus;

    async fn get_stats(&self) -> StorageResult<BackendStats>;
}

/// Join a base URL and a key with exactly one slash
pub(crate) fn join_url(base: &str, key: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        key.trim_start_matches('/')
    )
}
