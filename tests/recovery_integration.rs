/// Recovery scenarios: classified retries, bounded network waits and
/// resumable uploads that survive a restart.
use resilient_store::config::SessionSettings;
use resilient_store::recovery::{
    FileRecoveryOptions, NetworkMonitor, RecoveryManager, RecoveryOptions, RetryConfig,
    RetryExecutor, SessionStatus, UploadFile, UploadSessionTracker,
};
use resilient_store::{ErrorKind, StorageError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig::default()
        .with_max_retries(max_retries)
        .with_base_delay(Duration::from_millis(100))
        .with_jitter(false)
}

#[tokio::test(start_paused = true)]
async fn test_server_errors_exhaust_retry_budget() {
    let executor = RetryExecutor::new();
    let calls = AtomicU32::new(0);

    let outcome = executor
        .retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StorageError::http(503, "service unavailable")) }
            },
            "x",
            &fast_retry(2),
        )
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts_made, 3);
    assert_eq!(outcome.history.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        outcome.history.iter().map(|a| a.delay_ms).collect::<Vec<_>>(),
        vec![100, 200]
    );
    assert!(outcome
        .history
        .iter()
        .all(|a| a.kind == Some(ErrorKind::Server)));
}

#[tokio::test(start_paused = true)]
async fn test_validation_error_is_never_retried() {
    let executor = RetryExecutor::new();
    let calls = AtomicU32::new(0);

    let outcome = executor
        .retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StorageError::http(400, "bad request")) }
            },
            "x",
            &fast_retry(5),
        )
        .await;

    assert_eq!(outcome.attempts_made, 1);
    assert!(outcome.history.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_recovery_times_out_offline() {
    let monitor = NetworkMonitor::without_probe();
    monitor.set_online(false);

    let started = Instant::now();
    let recovered = monitor.wait_for_recovery(Duration::from_millis(500)).await;
    let waited = started.elapsed();

    assert!(!recovered);
    assert!(waited >= Duration::from_millis(500));
    assert!(waited < Duration::from_millis(600));
}

#[tokio::test(start_paused = true)]
async fn test_recovery_waits_for_network_then_retries() {
    let monitor = NetworkMonitor::without_probe();
    monitor.set_online(false);
    let manager = RecoveryManager::new(monitor.clone(), UploadSessionTracker::default());

    let restore = monitor.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        restore.set_online(true);
    });

    let calls = AtomicU32::new(0);
    let options = RecoveryOptions {
        retry: fast_retry(3),
        ..Default::default()
    };
    let value = manager
        .recover_from_network_error(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(StorageError::network("ECONNRESET", "reset"))
                    } else {
                        Ok(42)
                    }
                }
            },
            "fetch",
            &options,
        )
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_gives_up_when_network_stays_down() {
    let monitor = NetworkMonitor::without_probe();
    monitor.set_online(false);
    let manager = RecoveryManager::new(monitor, UploadSessionTracker::default());

    let options = RecoveryOptions {
        network_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    let err = manager
        .recover_from_network_error(|| async { Ok::<_, StorageError>(()) }, "noop", &options)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StorageError::NetworkUnavailable { waited_ms: 500 }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_file_upload_continues_from_recorded_progress() {
    let manager = RecoveryManager::default();
    let sessions = manager.sessions().clone();
    let offsets = Arc::new(Mutex::new(Vec::new()));
    let file = UploadFile::new("video.mp4", 4_000).with_chunk_size(1_000);

    let options = FileRecoveryOptions {
        recovery: RecoveryOptions {
            retry: fast_retry(3),
            ..Default::default()
        },
        ..Default::default()
    };

    let seen = offsets.clone();
    let outcome = manager
        .recover_file_upload(
            &file,
            move |point| {
                let sessions = sessions.clone();
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(point.offset_bytes);
                    let first = point.next_chunk.unwrap_or(0);
                    // Each attempt manages one chunk before the link drops
                    sessions.update_progress(&point.session_id, first, 1_000)?;
                    if first < 3 {
                        return Err(StorageError::network("ECONNRESET", "link dropped"));
                    }
                    Ok(())
                }
            },
            &options,
        )
        .await
        .unwrap();

    assert!(!outcome.resumed_existing);
    assert_eq!(outcome.attempts, 4);
    assert_eq!(outcome.resume_point, 4_000);
    assert_eq!(*offsets.lock().unwrap(), vec![0, 1_000, 2_000, 3_000]);

    let session = manager.sessions().get_session(&outcome.session_id).unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_sessions_survive_restart() {
    let dir = TempDir::new().unwrap();
    let settings = SessionSettings {
        database_path: Some(dir.path().join("sessions.db")),
        ..Default::default()
    };

    let session_id = {
        let manager =
            RecoveryManager::from_settings(&settings, NetworkMonitor::without_probe()).unwrap();
        let session = manager
            .sessions()
            .create_session("backup.tar", 3_000, Some(1_000))
            .unwrap();
        manager
            .sessions()
            .update_progress(&session.session_id, 0, 1_000)
            .unwrap();
        session.session_id
    };

    let manager =
        RecoveryManager::from_settings(&settings, NetworkMonitor::without_probe()).unwrap();
    let restored = manager.sessions().get_session(&session_id).unwrap();
    assert_eq!(restored.uploaded_bytes, 1_000);
    assert_eq!(restored.next_chunk(), Some(1));

    let offsets = Arc::new(Mutex::new(Vec::new()));
    let seen = offsets.clone();
    let outcome = manager
        .recover_file_upload(
            &UploadFile::new("backup.tar", 3_000).with_chunk_size(1_000),
            move |point| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(point.offset_bytes);
                    Ok(())
                }
            },
            &FileRecoveryOptions {
                session_id: Some(session_id.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(outcome.resumed_existing);
    assert_eq!(outcome.session_id, session_id);
    assert_eq!(*offsets.lock().unwrap(), vec![1_000]);
}
