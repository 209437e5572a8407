/// Builders for settings and managers used across integration tests
use super::mock_backend::ScriptedBackend;
use resilient_store::config::LocalSettings;
use resilient_store::{StorageBackend, StorageManager, StorageSettings};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Settings with the health loop off and the given backend order
pub fn settings(primary: &str, fallbacks: &[&str]) -> StorageSettings {
    let mut settings = StorageSettings {
        primary: primary.to_string(),
        fallbacks: fallbacks.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    };
    settings.health.enabled = false;
    settings
}

/// Local-only settings rooted in `dir`
#[allow(dead_code)]
pub fn local_settings(dir: &Path) -> StorageSettings {
    let mut settings = settings("local", &[]);
    settings.local = LocalSettings {
        base_path: dir.join("objects"),
        base_url: "/files".to_string(),
        enabled: true,
    };
    settings
}

/// Initialized manager over scripted backends, first one primary
#[allow(dead_code)]
pub async fn manager_with(backends: &[&ScriptedBackend]) -> StorageManager {
    let names: Vec<String> = backends.iter().map(|b| b.descriptor().name).collect();
    let fallbacks: Vec<&str> = names[1..].iter().map(String::as_str).collect();
    let mut settings = settings(&names[0], &fallbacks);
    settings.failover.blacklist_duration_ms = Duration::from_secs(60).as_millis() as u64;

    let backends: Vec<Arc<dyn StorageBackend>> = backends
        .iter()
        .map(|b| Arc::new((*b).clone()) as Arc<dyn StorageBackend>)
        .collect();

    let manager = StorageManager::with_backends(settings, backends).expect("valid settings");
    manager.initialize().await.expect("manager initializes");
    manager
}
