/// Recovery manager
///
/// Composes the retry executor, the network monitor and the upload session
/// tracker into end-to-end recovery flows. Independent of the storage
/// manager: any fallible async call can be run through it.
use super::classification::{ErrorClassifier, ErrorKind};
use super::network::{NetworkMonitor, NetworkQuality, NetworkStatus, DEFAULT_RECOVERY_TIMEOUT};
use super::retry::{RetryConfig, RetryExecutor, RetryOutcome};
use super::sessions::{ResumePoint, SessionDatabase, UploadSessionTracker};
use crate::config::SessionSettings;
use crate::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Coarse recommendation for how a caller should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryStrategy {
    /// Transient; try again
    Retry,
    /// Local problem; continue with reduced functionality
    GracefulDegradation,
    /// Needs credentials or permissions fixed by a person
    UserIntervention,
    /// Try another path (backend, format, flow)
    Fallback,
}

impl RecoveryStrategy {
    pub fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Network | ErrorKind::Server | ErrorKind::RateLimit => {
                RecoveryStrategy::Retry
            }
            ErrorKind::File => RecoveryStrategy::GracefulDegradation,
            ErrorKind::Authentication | ErrorKind::Permission => {
                RecoveryStrategy::UserIntervention
            }
            _ => RecoveryStrategy::Fallback,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Block on network recovery before the first attempt when offline
    pub wait_for_network: bool,
    pub network_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            wait_for_network: true,
            network_timeout: DEFAULT_RECOVERY_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }
}

/// File being uploaded through `recover_file_upload`
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub size_bytes: u64,
    pub chunk_size_bytes: Option<u64>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            chunk_size_bytes: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size_bytes: u64) -> Self {
        self.chunk_size_bytes = Some(chunk_size_bytes);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileRecoveryOptions {
    /// Existing session to resume, if any
    pub session_id: Option<String>,
    pub recovery: RecoveryOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecoveryOutcome {
    pub session_id: String,
    /// True when an existing session was continued
    pub resumed_existing: bool,
    pub resume_point: u64,
    pub attempts: u32,
}

pub struct RecoveryManager {
    classifier: ErrorClassifier,
    executor: RetryExecutor,
    network: NetworkMonitor,
    sessions: UploadSessionTracker,
    /// Set once this manager has started the shared background tasks
    started: AtomicBool,
    destroyed: AtomicBool,
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new(NetworkMonitor::without_probe(), UploadSessionTracker::default())
    }
}

impl RecoveryManager {
    pub fn new(network: NetworkMonitor, sessions: UploadSessionTracker) -> Self {
        Self {
            classifier: ErrorClassifier::new(),
            executor: RetryExecutor::new(),
            network,
            sessions,
            started: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Build from settings, restoring persisted sessions when a database is configured
    pub fn from_settings(settings: &SessionSettings, network: NetworkMonitor) -> StorageResult<Self> {
        let max_age = Duration::from_millis(settings.max_age_ms);
        let sessions = match &settings.database_path {
            Some(path) => {
                let tracker =
                    UploadSessionTracker::with_database(SessionDatabase::open(path)?, max_age);
                tracker.restore()?;
                tracker
            }
            None => UploadSessionTracker::new(max_age),
        };
        Ok(Self::new(network, sessions))
    }

    /// Start background session sweeps and network probing
    pub fn start(&self, cleanup_interval: Duration, probe_interval: Duration) {
        self.started.store(true, Ordering::SeqCst);
        self.sessions.start_cleanup(cleanup_interval);
        self.network.start_monitoring(probe_interval);
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn sessions(&self) -> &UploadSessionTracker {
        &self.sessions
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    pub fn get_network_status(&self) -> NetworkStatus {
        self.network.status()
    }

    pub fn get_network_quality(&self) -> NetworkQuality {
        self.network.quality()
    }

    pub fn get_recovery_strategy(&self, error: &StorageError) -> RecoveryStrategy {
        RecoveryStrategy::for_kind(self.classifier.classify(error))
    }

    /// Run a network-bound operation with network waiting and retries
    ///
    /// When offline and `wait_for_network` is set, waits for recovery first
    /// and fails with `NetworkUnavailable` if it never comes. Final failures
    /// are reported as `RecoveryFailed` carrying the operation name, attempt
    /// count and elapsed time.
    pub async fn recover_from_network_error<T, F, Fut>(
        &self,
        operation: F,
        name: &str,
        options: &RecoveryOptions,
    ) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        self.ensure_alive()?;
        self.await_network(options).await?;

        let outcome = self.executor.retry(operation, name, &options.retry).await;
        if outcome.success {
            return outcome.into_result();
        }
        Err(self.terminal_error(name, outcome))
    }

    /// Upload a file, resuming an existing session when possible
    ///
    /// `upload_fn` receives the resume point and is expected to report chunk
    /// progress through `sessions()`; each retry starts from the latest
    /// recorded progress.
    pub async fn recover_file_upload<F, Fut>(
        &self,
        file: &UploadFile,
        upload_fn: F,
        options: &FileRecoveryOptions,
    ) -> StorageResult<FileRecoveryOutcome>
    where
        F: Fn(ResumePoint) -> Fut,
        Fut: Future<Output = StorageResult<()>>,
    {
        self.ensure_alive()?;
        self.await_network(&options.recovery).await?;

        if let Some(session_id) = &options.session_id {
            match self.sessions.resume_upload(session_id, &upload_fn).await {
                Ok(resumed) => {
                    return Ok(FileRecoveryOutcome {
                        session_id: resumed.session_id,
                        resumed_existing: true,
                        resume_point: resumed.resume_point,
                        attempts: u32::from(resumed.resumed),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "Resume failed, starting a fresh upload session"
                    );
                }
            }
        }

        let session =
            self.sessions
                .create_session(&file.name, file.size_bytes, file.chunk_size_bytes)?;
        let session_id = session.session_id.clone();
        let operation_name = format!("upload {}", file.name);

        let outcome = self
            .executor
            .retry(
                || {
                    let point = self
                        .sessions
                        .get_session(&session_id)
                        .unwrap_or_else(|| session.clone())
                        .resume_point();
                    upload_fn(point)
                },
                &operation_name,
                &options.recovery.retry,
            )
            .await;

        if outcome.success {
            let completed = self.sessions.complete_session(&session_id)?;
            return Ok(FileRecoveryOutcome {
                session_id,
                resumed_existing: false,
                resume_point: completed.file_size_bytes,
                attempts: outcome.attempts_made,
            });
        }

        let error = self.terminal_error(&operation_name, outcome);
        // A sweep may have removed the session meanwhile
        let _ = self.sessions.mark_failed(&session_id, &error.to_string());
        Err(error)
    }

    /// Stop the background tasks this manager started and refuse further
    /// work. The monitor and tracker may be shared, so tasks started by
    /// another owner keep running. Safe to call repeatedly.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.started.load(Ordering::SeqCst) {
            self.sessions.stop();
            self.network.stop();
        }
        tracing::debug!("Recovery manager destroyed");
    }

    fn ensure_alive(&self) -> StorageResult<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(StorageError::Other(
                "recovery manager has been destroyed".to_string(),
            ));
        }
        Ok(())
    }

    async fn await_network(&self, options: &RecoveryOptions) -> StorageResult<()> {
        if !options.wait_for_network || self.network.is_online() {
            return Ok(());
        }
        if self.network.wait_for_recovery(options.network_timeout).await {
            Ok(())
        } else {
            Err(StorageError::NetworkUnavailable {
                waited_ms: options.network_timeout.as_millis() as u64,
            })
        }
    }

    fn terminal_error<T>(&self, name: &str, outcome: RetryOutcome<T>) -> StorageError {
        let attempts = outcome.attempts_made;
        let elapsed_ms = outcome.total_time_ms();
        let (kind, message) = match outcome.error {
            Some(error) => (self.classifier.classify(&error), error.to_string()),
            None => (ErrorKind::Unknown, "operation failed".to_string()),
        };

        tracing::error!(
            operation = name,
            attempts,
            elapsed_ms,
            kind = %kind,
            "Recovery exhausted"
        );

        StorageError::RecoveryFailed {
            operation: name.to_string(),
            attempts,
            elapsed_ms,
            kind,
            message,
        }
    }
}

impl Drop for RecoveryManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use test_case::test_case;

    fn quick_options() -> RecoveryOptions {
        RecoveryOptions {
            wait_for_network: true,
            network_timeout: Duration::from_millis(500),
            retry: RetryConfig::default()
                .with_max_retries(2)
                .with_base_delay(Duration::from_millis(100))
                .with_jitter(false),
        }
    }

    #[test_case(StorageError::network("ECONNREFUSED", "refused"), RecoveryStrategy::Retry ; "network")]
    #[test_case(StorageError::http(503, "unavailable"), RecoveryStrategy::Retry ; "server")]
    #[test_case(StorageError::http(429, "slow down"), RecoveryStrategy::Retry ; "rate limit")]
    #[test_case(StorageError::http(401, "bad token"), RecoveryStrategy::UserIntervention ; "auth")]
    #[test_case(StorageError::http(403, "denied"), RecoveryStrategy::UserIntervention ; "permission")]
    #[test_case(StorageError::from(std::io::Error::from(std::io::ErrorKind::NotFound)), RecoveryStrategy::GracefulDegradation ; "file")]
    #[test_case(StorageError::http(400, "bad request"), RecoveryStrategy::Fallback ; "validation")]
    fn test_recovery_strategy(error: StorageError, expected: RecoveryStrategy) {
        let manager = RecoveryManager::default();
        assert_eq!(manager.get_recovery_strategy(&error), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_wait_times_out() {
        let manager = RecoveryManager::default();
        manager.network().set_online(false);

        let calls = AtomicU32::new(0);
        let result: StorageResult<()> = manager
            .recover_from_network_error(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                "sync",
                &quick_options(),
            )
            .await;

        assert!(matches!(
            result,
            Err(StorageError::NetworkUnavailable { waited_ms: 500 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_recover() {
        let manager = RecoveryManager::default();
        let calls = AtomicU32::new(0);

        let value = manager
            .recover_from_network_error(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(StorageError::http(502, "bad gateway"))
                        } else {
                            Ok("done")
                        }
                    }
                },
                "fetch",
                &quick_options(),
            )
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_carries_context() {
        let manager = RecoveryManager::default();

        let result: StorageResult<()> = manager
            .recover_from_network_error(
                || async { Err(StorageError::http(400, "missing field")) },
                "create",
                &quick_options(),
            )
            .await;

        match result {
            Err(StorageError::RecoveryFailed {
                operation,
                attempts,
                kind,
                ..
            }) => {
                assert_eq!(operation, "create");
                assert_eq!(attempts, 1);
                assert_eq!(kind, ErrorKind::Validation);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_completed_session_is_not_reuploaded() {
        let manager = RecoveryManager::default();
        let session = manager
            .sessions()
            .create_session("photo.jpg", 100, Some(100))
            .unwrap();
        manager
            .sessions()
            .update_progress(&session.session_id, 0, 100)
            .unwrap();

        let calls = AtomicU32::new(0);
        let outcome = manager
            .recover_file_upload(
                &UploadFile::new("photo.jpg", 100),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                &FileRecoveryOptions {
                    session_id: Some(session.session_id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(outcome.resumed_existing);
        assert_eq!(outcome.resume_point, 100);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_continues_from_recorded_progress() {
        let manager = RecoveryManager::default();
        let sessions = manager.sessions().clone();
        let offsets = std::sync::Mutex::new(Vec::new());

        let outcome = manager
            .recover_file_upload(
                &UploadFile::new("archive.zip", 300).with_chunk_size(100),
                |point| {
                    offsets.lock().unwrap().push(point.offset_bytes);
                    let sessions = sessions.clone();
                    async move {
                        if point.offset_bytes == 0 {
                            sessions.update_progress(&point.session_id, 0, 100)?;
                            return Err(StorageError::network("ECONNRESET", "reset"));
                        }
                        Ok(())
                    }
                },
                &FileRecoveryOptions {
                    session_id: None,
                    recovery: quick_options(),
                },
            )
            .await
            .unwrap();

        assert!(!outcome.resumed_existing);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.resume_point, 300);
        assert_eq!(*offsets.lock().unwrap(), vec![0, 100]);
    }

    #[tokio::test]
    async fn test_unknown_session_starts_fresh() {
        let manager = RecoveryManager::default();

        let outcome = manager
            .recover_file_upload(
                &UploadFile::new("notes.txt", 10),
                |point| async move {
                    assert_eq!(point.offset_bytes, 0);
                    Ok(())
                },
                &FileRecoveryOptions {
                    session_id: Some("upload_gone_abcdef".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(!outcome.resumed_existing);
        assert_ne!(outcome.session_id, "upload_gone_abcdef");
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let manager = RecoveryManager::default();
        manager.destroy();
        manager.destroy();

        let result: StorageResult<()> = manager
            .recover_from_network_error(|| async { Ok(()) }, "noop", &RecoveryOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dropping_a_sharing_manager_keeps_owner_tasks() {
        let network = NetworkMonitor::without_probe();
        let sessions = UploadSessionTracker::default();
        let owner = RecoveryManager::new(network.clone(), sessions.clone());
        owner.start(Duration::from_secs(60), Duration::from_secs(5));
        assert!(sessions.is_cleanup_running());

        drop(RecoveryManager::new(network.clone(), sessions.clone()));
        assert!(sessions.is_cleanup_running());

        drop(owner);
        assert!(!sessions.is_cleanup_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_waits_for_network() {
        let manager = RecoveryManager::default();
        let session = manager
            .sessions()
            .create_session("clip.mov", 200, Some(100))
            .unwrap();
        manager.network().set_online(false);

        let calls = AtomicU32::new(0);
        let result = manager
            .recover_file_upload(
                &UploadFile::new("clip.mov", 200),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                &FileRecoveryOptions {
                    session_id: Some(session.session_id.clone()),
                    recovery: quick_options(),
                },
            )
            .await;

        assert!(matches!(
            result,
            Err(StorageError::NetworkUnavailable { waited_ms: 500 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
