/// S3-compatible cloud backend (Cloudflare R2, AWS S3, MinIO)
///
/// Built on `object_store`. Uploads above the multipart threshold are sent
/// part by part and aborted on any failure; content type, cache control and user
/// metadata travel as object attributes.
use super::keys::{self, sanitize_metadata};
use super::{
    join_url, BackendDescriptor, BackendKind, BackendStats, DownloadedObject, HealthStatus,
    ObjectInfo, StorageBackend, UploadOptions, UploadOutcome,
};
use crate::config::{CloudSettings, UploadSettings, CLOUD_BACKEND};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, MultipartUpload, ObjectStore,
    PutMultipartOpts, PutOptions, PutPayload, PutResult,
};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

pub struct CloudBackend {
    name: String,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    endpoint: String,
    public_url: Option<String>,
    cdn_domain: Option<String>,
    key_prefix: String,
    multipart_threshold: u64,
    multipart_chunk: usize,
}

impl CloudBackend {
    /// Build an S3 client from settings; fails when credentials are incomplete
    pub fn new(cloud: &CloudSettings, uploads: &UploadSettings) -> StorageResult<Self> {
        let missing = cloud.missing_fields();
        if !missing.is_empty() {
            return Err(StorageError::Config(format!(
                "cloud backend is missing {}",
                missing.join(", ")
            )));
        }

        // missing_fields() guarantees these are present
        let endpoint = cloud.resolved_endpoint().unwrap_or_default();
        let bucket = cloud.bucket.clone().unwrap_or_default();

        let mut builder = AmazonS3Builder::new()
            .with_access_key_id(cloud.access_key_id.clone().unwrap_or_default())
            .with_secret_access_key(cloud.secret_access_key.clone().unwrap_or_default())
            .with_bucket_name(&bucket)
            .with_region(&cloud.region)
            .with_endpoint(&endpoint);

        // For local MinIO/localstack endpoints
        if endpoint.starts_with("http://") {
            builder = builder.with_allow_http(true);
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::Config(format!("cloud client: {}", e)))?;

        tracing::info!(bucket = %bucket, endpoint = %endpoint, "Cloud backend configured");

        Ok(Self::with_store(Arc::new(store), cloud, uploads))
    }

    /// Wrap an existing object store (any `ObjectStore`, e.g. in-memory)
    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        cloud: &CloudSettings,
        uploads: &UploadSettings,
    ) -> Self {
        Self {
            name: CLOUD_BACKEND.to_string(),
            store,
            bucket: cloud.bucket.clone().unwrap_or_default(),
            endpoint: cloud.resolved_endpoint().unwrap_or_default(),
            public_url: cloud.public_url.clone().filter(|u| !u.trim().is_empty()),
            cdn_domain: cloud.cdn_domain.clone().filter(|d| !d.trim().is_empty()),
            key_prefix: uploads.key_prefix.clone(),
            multipart_threshold: uploads.multipart_threshold_bytes,
            multipart_chunk: uploads.multipart_chunk_bytes.max(1) as usize,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn path(key: &str) -> StorageResult<ObjectPath> {
        keys::validate_key(key)?;
        ObjectPath::parse(key).map_err(|e| StorageError::Validation(e.to_string()))
    }

    fn attributes(
        content_type: &str,
        cache_control: Option<&str>,
        metadata: &HashMap<String, String>,
    ) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from(content_type.to_string()),
        );
        if let Some(cache_control) = cache_control {
            attributes.insert(
                Attribute::CacheControl,
                AttributeValue::from(cache_control.to_string()),
            );
        }
        for (key, value) in metadata {
            attributes.insert(
                Attribute::Metadata(Cow::Owned(key.clone())),
                AttributeValue::from(value.clone()),
            );
        }
        attributes
    }

    /// Split attributes back into (content type, user metadata)
    fn read_attributes(attributes: &Attributes, key: &str) -> (String, HashMap<String, String>) {
        let mut content_type = None;
        let mut metadata = HashMap::new();

        for (attribute, value) in attributes.iter() {
            let value: &str = value.as_ref();
            match attribute {
                Attribute::ContentType => content_type = Some(value.to_string()),
                Attribute::Metadata(name) => {
                    metadata.insert(name.to_string(), value.to_string());
                }
                _ => {}
            }
        }

        (
            content_type.unwrap_or_else(|| keys::detect_content_type(key)),
            metadata,
        )
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        filename: &str,
        options: &UploadOptions,
    ) -> StorageResult<UploadOutcome> {
        let path = Self::path(key)?;
        let size_bytes = data.len() as u64;
        let content_type = options.resolve_content_type(filename);
        let metadata = sanitize_metadata(&options.metadata);
        let attributes =
            Self::attributes(&content_type, options.cache_control.as_deref(), &metadata);

        let result = if size_bytes > self.multipart_threshold {
            tracing::debug!(
                key,
                size_bytes,
                chunk_bytes = self.multipart_chunk,
                "Using multipart upload"
            );
            let upload = self
                .store
                .put_multipart_opts(
                    &path,
                    PutMultipartOpts {
                        attributes,
                        ..Default::default()
                    },
                )
                .await?;

            write_multipart(upload, data, self.multipart_chunk).await?
        } else {
            self.store
                .put_opts(
                    &path,
                    PutPayload::from(data),
                    PutOptions {
                        attributes,
                        ..Default::default()
                    },
                )
                .await?
        };

        Ok(UploadOutcome {
            success: true,
            key: key.to_string(),
            url: self.get_url(key),
            cdn_url: self.get_cdn_url(key),
            size_bytes,
            etag: result.e_tag.map(|tag| tag.trim_matches('"').to_string()),
            metadata,
            error: None,
            uploaded_at: Utc::now(),
        })
    }

    fn map_missing(key: &str, err: object_store::Error) -> StorageError {
        match err {
            object_store::Error::NotFound { .. } => StorageError::NotFound {
                key: key.to_string(),
            },
            other => other.into(),
        }
    }
}

#[async_trait]
impl StorageBackend for CloudBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::new(self.name.clone(), BackendKind::Cloud)
    }

    async fn upload(&self, data: Bytes, filename: &str, options: &UploadOptions) -> UploadOutcome {
        let size_bytes = data.len() as u64;
        let key = match options.resolve_key(&self.key_prefix, filename) {
            Ok(key) => key,
            Err(e) => return UploadOutcome::failed(filename, size_bytes, &e),
        };

        match self.put(&key, data, filename, options).await {
            Ok(outcome) => {
                tracing::debug!(backend = %self.name, key = %key, size_bytes, "Uploaded object");
                outcome
            }
            Err(e) => {
                tracing::warn!(backend = %self.name, key = %key, error = %e, "Cloud upload failed");
                UploadOutcome::failed(key, size_bytes, &e)
            }
        }
    }

    async fn download(&self, key: &str) -> StorageResult<DownloadedObject> {
        let path = Self::path(key)?;
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| Self::map_missing(key, e))?;

        let meta = result.meta.clone();
        let (content_type, metadata) = Self::read_attributes(&result.attributes, key);
        let bytes = result.bytes().await?;

        Ok(DownloadedObject {
            size_bytes: bytes.len() as u64,
            bytes,
            content_type,
            last_modified_at: meta.last_modified,
            etag: meta.e_tag.map(|tag| tag.trim_matches('"').to_string()),
            metadata,
        })
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = Self::path(key)?;
        // S3 deletes are idempotent; check first so a missing key is reported
        self.store
            .head(&path)
            .await
            .map_err(|e| Self::map_missing(key, e))?;
        self.store.delete(&path).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = Self::path(key)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn object_info(&self, key: &str) -> StorageResult<ObjectInfo> {
        let path = Self::path(key)?;
        let result = self
            .store
            .get_opts(
                &path,
                GetOptions {
                    head: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Self::map_missing(key, e))?;

        let (content_type, metadata) = Self::read_attributes(&result.attributes, key);
        Ok(ObjectInfo {
            key: key.to_string(),
            size_bytes: result.meta.size as u64,
            content_type,
            last_modified_at: result.meta.last_modified,
            etag: result.meta.e_tag.map(|tag| tag.trim_matches('"').to_string()),
            metadata,
        })
    }

    fn get_url(&self, key: &str) -> String {
        match &self.public_url {
            Some(public) => join_url(public, key),
            None => join_url(&join_url(&self.endpoint, &self.bucket), key),
        }
    }

    fn get_cdn_url(&self, key: &str) -> Option<String> {
        self.cdn_domain.as_ref().map(|domain| {
            if domain.starts_with("http://") || domain.starts_with("https://") {
                join_url(domain, key)
            } else {
                join_url(&format!("https://{}", domain), key)
            }
        })
    }

    async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let first = self.store.list(None).next().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match first {
            Some(Err(e)) => {
                tracing::warn!(backend = %self.name, error = %e, "Cloud health check failed");
                HealthStatus::unhealthy(e.to_string()).with_detail("bucket", self.bucket.clone())
            }
            Some(Ok(_)) | None => {
                HealthStatus::healthy(latency_ms).with_detail("bucket", self.bucket.clone())
            }
        }
    }

    async fn get_stats(&self) -> StorageResult<BackendStats> {
        let mut total_files = 0u64;
        let mut total_size_bytes = 0u64;
        let mut listing = self.store.list(None);

        while let Some(meta) = listing.next().await {
            let meta = meta?;
            total_files += 1;
            total_size_bytes += meta.size as u64;
        }

        Ok(BackendStats {
            total_files,
            total_size_bytes,
            // Object storage has no meaningful free-space figure
            available_space_bytes: None,
            timestamp: Utc::now(),
        })
    }
}

/// Send `data` as sequential parts; any failure aborts the upload so no
/// orphaned parts stay behind in the bucket
async fn write_multipart(
    mut upload: Box<dyn MultipartUpload>,
    data: Bytes,
    chunk_size: usize,
) -> StorageResult<PutResult> {
    match send_parts(upload.as_mut(), &data, chunk_size.max(1)).await {
        Ok(result) => Ok(result),
        Err(e) => {
            if let Err(abort_err) = upload.abort().await {
                tracing::warn!(error = %abort_err, "Failed to abort multipart upload");
            }
            Err(e.into())
        }
    }
}

async fn send_parts(
    upload: &mut dyn MultipartUpload,
    data: &Bytes,
    chunk_size: usize,
) -> object_store::Result<PutResult> {
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + chunk_size).min(data.len());
        upload
            .put_part(PutPayload::from(data.slice(offset..end)))
            .await?;
        offset = end;
    }
    upload.complete().await
}
