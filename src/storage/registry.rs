/// Backend registry and per-backend failover state
///
/// Holds every constructed backend next to its `FailoverState`. A backend is
/// blacklisted after `threshold` consecutive failures and becomes available
/// again, with a zeroed failure count, on the first access after the
/// blacklist window ends.
use crate::backends::{BackendDescriptor, StorageBackend};
use crate::config::FailoverSettings;
use crate::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverPolicy {
    /// Consecutive failures before blacklisting
    pub threshold: u32,
    pub blacklist_duration: Duration,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            blacklist_duration: Duration::from_secs(5 * 60),
        }
    }
}

impl From<&FailoverSettings> for FailoverPolicy {
    fn from(settings: &FailoverSettings) -> Self {
        Self {
            threshold: settings.threshold.max(1),
            blacklist_duration: settings.blacklist_duration(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverState {
    pub backend_name: String,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub is_blacklisted: bool,
    #[serde(skip)]
    pub blacklist_until: Option<Instant>,
    pub last_error: Option<String>,
}

impl FailoverState {
    fn new(backend_name: &str) -> Self {
        Self {
            backend_name: backend_name.to_string(),
            failure_count: 0,
            last_failure_at: None,
            is_blacklisted: false,
            blacklist_until: None,
            last_error: None,
        }
    }

    /// Time left on the blacklist, if any
    pub fn blacklist_remaining(&self) -> Option<Duration> {
        self.blacklist_until
            .filter(|_| self.is_blacklisted)
            .map(|until| until.saturating_duration_since(Instant::now()))
    }

    fn clear(&mut self) {
        self.failure_count = 0;
        self.is_blacklisted = false;
        self.blacklist_until = None;
    }

    /// Lift an expired blacklist; returns true when it did
    fn expire(&mut self, now: Instant) -> bool {
        match self.blacklist_until {
            Some(until) if self.is_blacklisted && now >= until => {
                self.clear();
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct Priority {
    primary: String,
    fallbacks: Vec<String>,
}

pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn StorageBackend>>,
    /// Registration order, used for reports
    order: Vec<String>,
    states: Mutex<HashMap<String, FailoverState>>,
    priority: Mutex<Priority>,
    policy: FailoverPolicy,
}

impl BackendRegistry {
    pub fn new(policy: FailoverPolicy, primary: &str, fallbacks: &[String]) -> Self {
        Self {
            backends: HashMap::new(),
            order: Vec::new(),
            states: Mutex::new(HashMap::new()),
            priority: Mutex::new(Priority {
                primary: primary.to_string(),
                fallbacks: fallbacks.to_vec(),
            }),
            policy,
        }
    }

    /// Add a backend; a backend with the same name replaces the old one
    pub fn register(&mut self, backend: Arc<dyn StorageBackend>) {
        let name = backend.descriptor().name;
        if self.backends.insert(name.clone(), backend).is_none() {
            self.order.push(name.clone());
        }
        self.states
            .lock()
            .unwrap()
            .insert(name.clone(), FailoverState::new(&name));
        tracing::debug!(backend = %name, "Registered storage backend");
    }

    pub fn policy(&self) -> FailoverPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StorageBackend>> {
        self.backends.get(name).cloned()
    }

    /// Registered backends in registration order
    pub fn all(&self) -> Vec<Arc<dyn StorageBackend>> {
        self.order
            .iter()
            .filter_map(|name| self.backends.get(name).cloned())
            .collect()
    }

    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.all().iter().map(|b| b.descriptor()).collect()
    }

    pub fn primary(&self) -> String {
        self.priority.lock().unwrap().primary.clone()
    }

    pub fn fallbacks(&self) -> Vec<String> {
        self.priority.lock().unwrap().fallbacks.clone()
    }

    /// False for unknown and blacklisted backends; lifts expired blacklists
    pub fn is_available(&self, name: &str) -> bool {
        if !self.contains(name) {
            return false;
        }

        let mut states = self.states.lock().unwrap();
        match states.get_mut(name) {
            Some(state) => {
                if state.expire(Instant::now()) {
                    tracing::info!(backend = %name, "Blacklist expired, backend available again");
                }
                !state.is_blacklisted
            }
            None => true,
        }
    }

    /// Primary first, then fallbacks in order, skipping duplicates and
    /// unavailable backends
    pub fn available_backends_by_priority(&self) -> Vec<Arc<dyn StorageBackend>> {
        let priority = self.priority.lock().unwrap().clone();
        let mut seen: Vec<&str> = Vec::new();
        let mut available = Vec::new();

        for name in std::iter::once(&priority.primary).chain(priority.fallbacks.iter()) {
            if seen.contains(&name.as_str()) {
                continue;
            }
            seen.push(name);

            if self.is_available(name) {
                if let Some(backend) = self.get(name) {
                    available.push(backend);
                }
            }
        }

        available
    }

    pub fn record_success(&self, name: &str) {
        let mut states = self.states.lock().unwrap();
        if let Some(state) = states.get_mut(name) {
            if state.failure_count > 0 || state.is_blacklisted {
                tracing::info!(
                    backend = %name,
                    previous_failures = state.failure_count,
                    "Backend recovered, failure count reset"
                );
            }
            state.clear();
            state.last_error = None;
        }
    }

    /// Count a failure and blacklist once the threshold is reached
    pub fn record_failure(&self, name: &str, error: &str) -> Option<FailoverState> {
        let mut states = self.states.lock().unwrap();
        let state = states.get_mut(name)?;
        let now = Instant::now();

        state.expire(now);
        state.failure_count += 1;
        state.last_failure_at = Some(Utc::now());
        state.last_error = Some(error.to_string());

        if state.failure_count >= self.policy.threshold && !state.is_blacklisted {
            state.is_blacklisted = true;
            state.blacklist_until = Some(now + self.policy.blacklist_duration);
            tracing::warn!(
                backend = %name,
                failures = state.failure_count,
                blacklisted_for = %humantime::format_duration(self.policy.blacklist_duration),
                "Backend blacklisted after repeated failures"
            );
        } else {
            tracing::debug!(
                backend = %name,
                failures = state.failure_count,
                threshold = self.policy.threshold,
                "Recorded backend failure"
            );
        }

        Some(state.clone())
    }

    /// Clear failures and blacklist for one backend
    pub fn reset(&self, name: &str) -> StorageResult<()> {
        let mut states = self.states.lock().unwrap();
        let state = states
            .get_mut(name)
            .ok_or_else(|| StorageError::UnknownBackend(name.to_string()))?;
        state.clear();
        state.last_error = None;
        tracing::info!(backend = %name, "Backend failover state reset");
        Ok(())
    }

    pub fn reset_all(&self) {
        for state in self.states.lock().unwrap().values_mut() {
            state.clear();
            state.last_error = None;
        }
        tracing::info!("All backend failover states reset");
    }

    /// Make `name` the primary; the old primary becomes the first fallback
    pub fn set_primary(&self, name: &str) -> StorageResult<()> {
        if !self.contains(name) {
            return Err(StorageError::UnknownBackend(name.to_string()));
        }

        let mut priority = self.priority.lock().unwrap();
        if priority.primary == name {
            return Ok(());
        }

        let previous = std::mem::replace(&mut priority.primary, name.to_string());
        priority.fallbacks.retain(|f| f != name && *f != previous);
        priority.fallbacks.insert(0, previous.clone());

        tracing::info!(from = %previous, to = %name, "Primary backend switched");
        Ok(())
    }

    /// Current state of one backend, with expiry applied
    pub fn state(&self, name: &str) -> Option<FailoverState> {
        let mut states = self.states.lock().unwrap();
        let state = states.get_mut(name)?;
        state.expire(Instant::now());
        Some(state.clone())
    }

    /// States of all backends in registration order
    pub fn states(&self) -> Vec<FailoverState> {
        self.order.iter().filter_map(|name| self.state(name)).collect()
    }
}
