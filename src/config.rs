/// Storage settings
///
/// Loaded from an optional config file (TOML, YAML or JSON by extension)
/// layered under `RSTORE_*` environment variables, where `__` separates
/// nested keys: `RSTORE_CLOUD__BUCKET`, `RSTORE_FAILOVER__THRESHOLD`.
use crate::{StorageError, StorageResult};
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "RSTORE";

/// Backend names understood by the manager
pub const CLOUD_BACKEND: &str = "cloud";
pub const LOCAL_BACKEND: &str = "local";

/// S3 rejects multipart parts smaller than this (except the last)
const MIN_MULTIPART_CHUNK: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Preferred backend
    pub primary: String,
    /// Backends tried after the primary, in order
    pub fallbacks: Vec<String>,
    pub cloud: CloudSettings,
    pub local: LocalSettings,
    pub failover: FailoverSettings,
    pub health: HealthSettings,
    pub uploads: UploadSettings,
    pub sessions: SessionSettings,
    pub metrics: MetricsSettings,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            primary: CLOUD_BACKEND.to_string(),
            fallbacks: vec![LOCAL_BACKEND.to_string()],
            cloud: CloudSettings::default(),
            local: LocalSettings::default(),
            failover: FailoverSettings::default(),
            health: HealthSettings::default(),
            uploads: UploadSettings::default(),
            sessions: SessionSettings::default(),
            metrics: MetricsSettings::default(),
        }
    }
}

/// S3-compatible object storage (R2, S3, MinIO)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSettings {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub bucket: Option<String>,
    pub endpoint: Option<String>,
    /// Cloudflare account id; derives the endpoint when none is given
    pub account_id: Option<String>,
    pub region: String,
    pub cdn_domain: Option<String>,
    /// Public base URL for object links
    pub public_url: Option<String>,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            access_key_id: None,
            secret_access_key: None,
            bucket: None,
            endpoint: None,
            account_id: None,
            region: "auto".to_string(),
            cdn_domain: None,
            public_url: None,
        }
    }
}

impl CloudSettings {
    /// Endpoint given explicitly or derived from the account id
    pub fn resolved_endpoint(&self) -> Option<String> {
        non_empty(&self.endpoint).map(str::to_string).or_else(|| {
            non_empty(&self.account_id)
                .map(|id| format!("https://{}.r2.cloudflarestorage.com", id))
        })
    }

    /// Names of the settings required to build the cloud backend that are absent
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if non_empty(&self.access_key_id).is_none() {
            missing.push("access_key_id");
        }
        if non_empty(&self.secret_access_key).is_none() {
            missing.push("secret_access_key");
        }
        if non_empty(&self.bucket).is_none() {
            missing.push("bucket");
        }
        if self.resolved_endpoint().is_none() {
            missing.push("endpoint or account_id");
        }
        missing
    }

    pub fn is_configured(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    pub base_path: PathBuf,
    /// Prefix for URLs handed out for local objects
    pub base_url: String,
    pub enabled: bool,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            base_path: default_data_dir().join("objects"),
            base_url: "/files".to_string(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverSettings {
    /// Consecutive failures before a backend is blacklisted
    pub threshold: u32,
    pub blacklist_duration_ms: u64,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            threshold: 3,
            blacklist_duration_ms: 5 * 60 * 1000,
        }
    }
}

impl FailoverSettings {
    pub fn blacklist_duration(&self) -> Duration {
        Duration::from_millis(self.blacklist_duration_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5 * 60 * 1000,
            timeout_ms: 10_000,
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Prefix for generated keys
    pub key_prefix: String,
    /// Uploads above this size use multipart transfer
    pub multipart_threshold_bytes: u64,
    pub multipart_chunk_bytes: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            key_prefix: "uploads".to_string(),
            multipart_threshold_bytes: 100 * 1024 * 1024,
            multipart_chunk_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub max_age_ms: u64,
    pub cleanup_interval_ms: u64,
    /// SQLite file for persisted sessions; in-memory only when unset
    pub database_path: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_age_ms: 24 * 60 * 60 * 1000,
            cleanup_interval_ms: 60 * 60 * 1000,
            database_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub max_retained_results: usize,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            max_retained_results: 1000,
        }
    }
}

/// Platform data directory, e.g. `~/.local/share/rstore` on Linux
pub fn default_data_dir() -> PathBuf {
    ProjectDirs::from("dev", "resilient-store", "rstore")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

impl StorageSettings {
    /// Load settings from environment variables only
    pub fn from_env() -> StorageResult<Self> {
        Self::load(None)
    }

    /// Load settings from an optional file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> StorageResult<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("fallbacks"),
        );

        let settings: StorageSettings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| StorageError::Config(e.to_string()))?;

        settings.validate()?;

        tracing::debug!(
            primary = %settings.primary,
            fallbacks = ?settings.fallbacks,
            cloud_configured = settings.cloud.is_configured(),
            local_enabled = settings.local.enabled,
            "Loaded storage settings"
        );

        Ok(settings)
    }

    /// Reject values that would make the manager misbehave
    pub fn validate(&self) -> StorageResult<()> {
        self.validate_limits()?;
        for name in self.backend_order() {
            if name != CLOUD_BACKEND && name != LOCAL_BACKEND {
                return Err(StorageError::Config(format!(
                    "unknown backend '{}' (expected '{}' or '{}')",
                    name, CLOUD_BACKEND, LOCAL_BACKEND
                )));
            }
        }
        for (field, value) in [
            ("cloud.endpoint", &self.cloud.endpoint),
            ("cloud.public_url", &self.cloud.public_url),
        ] {
            if let Some(value) = non_empty(value) {
                Url::parse(value).map_err(|e| {
                    StorageError::Config(format!("{} is not a valid URL: {}", field, e))
                })?;
            }
        }
        Ok(())
    }

    /// Value checks that leave backend names unrestricted
    pub fn validate_limits(&self) -> StorageResult<()> {
        let invalid = |msg: &str| Err(StorageError::Config(msg.to_string()));

        if self.primary.trim().is_empty() {
            return invalid("primary backend must be set");
        }
        if self.failover.threshold == 0 {
            return invalid("failover.threshold must be at least 1");
        }
        if self.failover.blacklist_duration_ms == 0 {
            return invalid("failover.blacklist_duration_ms must be greater than zero");
        }
        if self.health.enabled && self.health.interval_ms == 0 {
            return invalid("health.interval_ms must be greater than zero");
        }
        if self.health.timeout_ms == 0 {
            return invalid("health.timeout_ms must be greater than zero");
        }
        if self.uploads.multipart_chunk_bytes < MIN_MULTIPART_CHUNK {
            return invalid("uploads.multipart_chunk_bytes must be at least 5 MiB");
        }
        if self.uploads.multipart_threshold_bytes == 0 {
            return invalid("uploads.multipart_threshold_bytes must be greater than zero");
        }
        if self.sessions.max_age_ms == 0 || self.sessions.cleanup_interval_ms == 0 {
            return invalid("session max age and cleanup interval must be greater than zero");
        }
        if self.metrics.max_retained_results == 0 {
            return invalid("metrics.max_retained_results must be at least 1");
        }

        Ok(())
    }

    /// Primary followed by fallbacks, without duplicates
    pub fn backend_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::with_capacity(1 + self.fallbacks.len());
        for name in std::iter::once(&self.primary).chain(self.fallbacks.iter()) {
            let name = name.trim();
            if !name.is_empty() && !order.iter().any(|n| n == name) {
                order.push(name.to_string());
            }
        }
        order
    }
}
