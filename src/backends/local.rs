/// Local filesystem backend
///
/// Objects live at `{base_path}/{key}`; an optional sidecar at
/// `{base_path}/{key}.meta` holds `{contentType, metadata, uploadedAt, etag}`
/// as JSON. A missing or unreadable sidecar is tolerated everywhere.
use super::keys::{self, sanitize_metadata};
use super::{
    join_url, BackendDescriptor, BackendKind, BackendStats, DownloadedObject, HealthStatus,
    ObjectInfo, StorageBackend, UploadOptions, UploadOutcome,
};
use crate::config::{LocalSettings, UploadSettings, LOCAL_BACKEND};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use uuid::Uuid;

const META_SUFFIX: &str = ".meta";
const HEALTH_DIR: &str = ".health";
const TEMP_MARKER: &str = ".tmp-";

/// Sidecar metadata stored next to each object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    content_type: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    uploaded_at: DateTime<Utc>,
    #[serde(default)]
    etag: Option<String>,
}

pub struct LocalBackend {
    name: String,
    base_path: PathBuf,
    base_url: String,
    key_prefix: String,
    chunked_threshold: u64,
    chunk_size: usize,
}

impl LocalBackend {
    /// Create the backend, creating `base_path` if needed
    pub fn new(local: &LocalSettings, uploads: &UploadSettings) -> StorageResult<Self> {
        std::fs::create_dir_all(&local.base_path)?;

        Ok(Self {
            name: LOCAL_BACKEND.to_string(),
            base_path: local.base_path.clone(),
            base_url: local.base_url.clone(),
            key_prefix: uploads.key_prefix.clone(),
            chunked_threshold: uploads.multipart_threshold_bytes,
            chunk_size: uploads.multipart_chunk_bytes.max(1) as usize,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        keys::validate_key(key)?;
        let name = key.rsplit(['/', '\\']).next().unwrap_or(key);
        if is_internal(name) || key.split(['/', '\\']).next() == Some(HEALTH_DIR) {
            return Err(StorageError::Validation(format!(
                "object key is reserved for backend bookkeeping: {}",
                key
            )));
        }
        Ok(self.base_path.join(key))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(META_SUFFIX);
        PathBuf::from(name)
    }

    async fn read_sidecar(path: &Path) -> Option<Sidecar> {
        let raw = tokio::fs::read(Self::sidecar_path(path)).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(sidecar) => Some(sidecar),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Ignoring unreadable sidecar");
                None
            }
        }
    }

    /// Write `data` to `path` via a temp file and rename
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut temp = path.as_os_str().to_os_string();
        temp.push(format!("{}{}", TEMP_MARKER, Uuid::new_v4().simple()));
        let temp = PathBuf::from(temp);

        let result = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            if data.len() as u64 > self.chunked_threshold {
                for chunk in data.chunks(self.chunk_size) {
                    file.write_all(chunk).await?;
                }
            } else {
                file.write_all(data).await?;
            }
            file.sync_all().await?;
            tokio::fs::rename(&temp, path).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn store(
        &self,
        key: &str,
        data: Bytes,
        filename: &str,
        options: &UploadOptions,
    ) -> StorageResult<UploadOutcome> {
        let path = self.object_path(key)?;
        let size_bytes = data.len() as u64;
        let content_type = options.resolve_content_type(filename);
        let metadata = sanitize_metadata(&options.metadata);
        let etag = format!("{:x}", Sha256::digest(&data));
        let uploaded_at = Utc::now();

        if size_bytes > self.chunked_threshold {
            tracing::debug!(key, size_bytes, "Writing large object in chunks");
        }
        let sidecar = Sidecar {
            content_type: content_type.clone(),
            metadata: metadata.clone(),
            uploaded_at,
            etag: Some(etag.clone()),
        };
        let sidecar = serde_json::to_vec(&sidecar)?;

        self.write_atomic(&path, &data).await?;
        if let Err(e) = self.write_atomic(&Self::sidecar_path(&path), &sidecar).await {
            // An object without its sidecar would still be served
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }

        Ok(UploadOutcome {
            success: true,
            key: key.to_string(),
            url: self.get_url(key),
            cdn_url: None,
            size_bytes,
            etag: Some(etag),
            metadata,
            error: None,
            uploaded_at,
        })
    }

    async fn probe(&self) -> StorageResult<()> {
        let probe = self
            .base_path
            .join(HEALTH_DIR)
            .join(Uuid::new_v4().to_string());
        let payload = b"health-check";

        if let Some(parent) = probe.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&probe, payload).await?;
        let read_back = tokio::fs::read(&probe).await;
        let removed = tokio::fs::remove_file(&probe).await;

        if read_back? != payload {
            return Err(StorageError::Other(
                "health probe read back different content".to_string(),
            ));
        }
        removed?;
        Ok(())
    }

    async fn available_space(&self) -> Option<u64> {
        let base_path = self.base_path.clone();
        tokio::task::spawn_blocking(move || available_space_at(&base_path))
            .await
            .ok()
            .flatten()
    }
}

/// Free space on the mount holding `path`
fn available_space_at(path: &Path) -> Option<u64> {
    let base = std::fs::canonicalize(path).ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| base.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

fn is_internal(name: &str) -> bool {
    name.ends_with(META_SUFFIX) || name.contains(TEMP_MARKER)
}

fn not_found_as(key: &str, err: std::io::Error) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound {
            key: key.to_string(),
        }
    } else {
        err.into()
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::new(self.name.clone(), BackendKind::Local)
    }

    async fn upload(&self, data: Bytes, filename: &str, options: &UploadOptions) -> UploadOutcome {
        let size_bytes = data.len() as u64;
        let key = match options.resolve_key(&self.key_prefix, filename) {
            Ok(key) => key,
            Err(e) => return UploadOutcome::failed(filename, size_bytes, &e),
        };

        match self.store(&key, data, filename, options).await {
            Ok(outcome) => {
                tracing::debug!(backend = %self.name, key = %key, size_bytes, "Stored object");
                outcome
            }
            Err(e) => {
                tracing::warn!(backend = %self.name, key = %key, error = %e, "Local upload failed");
                UploadOutcome::failed(key, size_bytes, &e)
            }
        }
    }

    async fn download(&self, key: &str) -> StorageResult<DownloadedObject> {
        let path = self.object_path(key)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| not_found_as(key, e))?;
        let fs_meta = tokio::fs::metadata(&path).await?;
        let sidecar = Self::read_sidecar(&path).await;

        let last_modified_at = fs_meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(DownloadedObject {
            size_bytes: bytes.len() as u64,
            content_type: sidecar
                .as_ref()
                .map(|s| s.content_type.clone())
                .unwrap_or_else(|| keys::detect_content_type(key)),
            last_modified_at,
            etag: sidecar.as_ref().and_then(|s| s.etag.clone()),
            metadata: sidecar.map(|s| s.metadata).unwrap_or_default(),
            bytes: Bytes::from(bytes),
        })
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.object_path(key)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| not_found_as(key, e))?;

        if let Err(e) = tokio::fs::remove_file(Self::sidecar_path(&path)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(key, error = %e, "Failed to remove sidecar");
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.object_path(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn object_info(&self, key: &str) -> StorageResult<ObjectInfo> {
        let path = self.object_path(key)?;
        let fs_meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| not_found_as(key, e))?;
        let sidecar = Self::read_sidecar(&path).await;

        Ok(ObjectInfo {
            key: key.to_string(),
            size_bytes: fs_meta.len(),
            content_type: sidecar
                .as_ref()
                .map(|s| s.content_type.clone())
                .unwrap_or_else(|| keys::detect_content_type(key)),
            last_modified_at: fs_meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
            etag: sidecar.as_ref().and_then(|s| s.etag.clone()),
            metadata: sidecar.map(|s| s.metadata).unwrap_or_default(),
        })
    }

    fn get_url(&self, key: &str) -> String {
        join_url(&self.base_url, key)
    }

    fn get_cdn_url(&self, _key: &str) -> Option<String> {
        None
    }

    async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        match self.probe().await {
            Ok(()) => HealthStatus::healthy(started.elapsed().as_millis() as u64)
                .with_detail("basePath", self.base_path.display().to_string()),
            Err(e) => {
                tracing::warn!(backend = %self.name, error = %e, "Local health check failed");
                HealthStatus::unhealthy(e.to_string())
                    .with_detail("basePath", self.base_path.display().to_string())
            }
        }
    }

    async fn get_stats(&self) -> StorageResult<BackendStats> {
        let mut total_files = 0u64;
        let mut total_size_bytes = 0u64;
        let mut pending = vec![self.base_path.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    if name != HEALTH_DIR {
                        pending.push(entry.path());
                    }
                } else if file_type.is_file() && !is_internal(&name) {
                    total_files += 1;
                    total_size_bytes += entry.metadata().await?.len();
                }
            }
        }

        Ok(BackendStats {
            total_files,
            total_size_bytes,
            available_space_bytes: self.available_space().await,
            timestamp: Utc::now(),
        })
    }
}
