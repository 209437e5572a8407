/// Scripted in-memory backend for failover scenarios
///
/// Objects live in a `HashMap`. Uploads and downloads consume a queue of
/// scripted failures before falling back to the standing behaviour, which is
/// either success or a permanent error. Call counters let tests assert which
/// backend was tried and how often.
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use resilient_store::backends::{
    BackendDescriptor, BackendKind, BackendStats, DownloadedObject, HealthStatus, ObjectInfo,
    StorageBackend, UploadOptions, UploadOutcome,
};
use resilient_store::{StorageError, StorageResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct CallCounts {
    pub uploads: AtomicUsize,
    pub downloads: AtomicUsize,
    pub deletes: AtomicUsize,
    pub health_checks: AtomicUsize,
}

#[derive(Default)]
struct Script {
    upload_failures: VecDeque<StorageError>,
    download_failures: VecDeque<StorageError>,
    always_fail: Option<StorageError>,
    unhealthy: Option<String>,
}

#[derive(Clone)]
pub struct ScriptedBackend {
    name: String,
    kind: BackendKind,
    objects: Arc<Mutex<HashMap<String, (Bytes, String)>>>,
    script: Arc<Mutex<Script>>,
    pub calls: Arc<CallCounts>,
}

#[allow(dead_code)]
impl ScriptedBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: BackendKind::Local,
            objects: Arc::new(Mutex::new(HashMap::new())),
            script: Arc::new(Mutex::new(Script::default())),
            calls: Arc::new(CallCounts::default()),
        }
    }

    pub fn cloud(name: &str) -> Self {
        Self {
            kind: BackendKind::Cloud,
            ..Self::new(name)
        }
    }

    /// Queue `count` upload failures ahead of normal behaviour
    pub fn fail_next_uploads(&self, count: usize, error: StorageError) -> &Self {
        let mut script = self.script.lock().unwrap();
        for _ in 0..count {
            script.upload_failures.push_back(error.clone());
        }
        self
    }

    pub fn fail_next_downloads(&self, count: usize, error: StorageError) -> &Self {
        let mut script = self.script.lock().unwrap();
        for _ in 0..count {
            script.download_failures.push_back(error.clone());
        }
        self
    }

    /// Fail every upload and download until `heal` is called
    pub fn fail_always(&self, error: StorageError) -> &Self {
        self.script.lock().unwrap().always_fail = Some(error);
        self
    }

    pub fn set_unhealthy(&self, reason: &str) -> &Self {
        self.script.lock().unwrap().unhealthy = Some(reason.to_string());
        self
    }

    pub fn heal(&self) -> &Self {
        *self.script.lock().unwrap() = Script::default();
        self
    }

    /// Store an object directly, bypassing the script
    pub fn seed(&self, key: &str, data: &[u8]) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            (Bytes::copy_from_slice(data), "application/octet-stream".to_string()),
        );
    }

    pub fn holds(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn upload_calls(&self) -> usize {
        self.calls.uploads.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.calls.downloads.load(Ordering::SeqCst)
    }

    fn next_upload_failure(&self) -> Option<StorageError> {
        let mut script = self.script.lock().unwrap();
        script
            .upload_failures
            .pop_front()
            .or_else(|| script.always_fail.clone())
    }

    fn next_download_failure(&self) -> Option<StorageError> {
        let mut script = self.script.lock().unwrap();
        script
            .download_failures
            .pop_front()
            .or_else(|| script.always_fail.clone())
    }
}

#[async_trait]
impl StorageBackend for ScriptedBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::new(self.name.clone(), self.kind)
    }

    async fn upload(&self, data: Bytes, filename: &str, options: &UploadOptions) -> UploadOutcome {
        self.calls.uploads.fetch_add(1, Ordering::SeqCst);
        let size_bytes = data.len() as u64;

        let key = match options.resolve_key("uploads", filename) {
            Ok(key) => key,
            Err(e) => return UploadOutcome::failed(filename, size_bytes, &e),
        };
        if let Some(error) = self.next_upload_failure() {
            return UploadOutcome::failed(key, size_bytes, &error);
        }

        let content_type = options.resolve_content_type(filename);
        self.objects
            .lock()
            .unwrap()
            .insert(key.clone(), (data, content_type));

        UploadOutcome {
            success: true,
            url: format!("mem://{}/{}", self.name, key),
            key,
            cdn_url: None,
            size_bytes,
            etag: None,
            metadata: options.metadata.clone(),
            error: None,
            uploaded_at: Utc::now(),
        }
    }

    async fn download(&self, key: &str) -> StorageResult<DownloadedObject> {
        self.calls.downloads.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.next_download_failure() {
            return Err(error);
        }

        let objects = self.objects.lock().unwrap();
        let (bytes, content_type) = objects.get(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;
        Ok(DownloadedObject {
            size_bytes: bytes.len() as u64,
            bytes: bytes.clone(),
            content_type: content_type.clone(),
            last_modified_at: Utc::now(),
            etag: None,
            metadata: HashMap::new(),
        })
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.calls.deletes.fetch_add(1, Ordering::SeqCst);
        match self.objects.lock().unwrap().remove(key) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.holds(key))
    }

    async fn object_info(&self, key: &str) -> StorageResult<ObjectInfo> {
        let objects = self.objects.lock().unwrap();
        let (bytes, content_type) = objects.get(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size_bytes: bytes.len() as u64,
            content_type: content_type.clone(),
            last_modified_at: Utc::now(),
            etag: None,
            metadata: HashMap::new(),
        })
    }

    fn get_url(&self, key: &str) -> String {
        format!("mem://{}/{}", self.name, key)
    }

    fn get_cdn_url(&self, _key: &str) -> Option<String> {
        None
    }

    async fn health_check(&self) -> HealthStatus {
        self.calls.health_checks.fetch_add(1, Ordering::SeqCst);
        match &self.script.lock().unwrap().unhealthy {
            Some(reason) => HealthStatus::unhealthy(reason.clone()),
            None => HealthStatus::healthy(1),
        }
    }

    async fn get_stats(&self) -> StorageResult<BackendStats> {
        let objects = self.objects.lock().unwrap();
        Ok(BackendStats {
            total_files: objects.len() as u64,
            total_size_bytes: objects.values().map(|(b, _)| b.len() as u64).sum(),
            available_space_bytes: None,
            timestamp: Utc::now(),
        })
    }
}
