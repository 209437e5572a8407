// Rolling per-backend operation metrics

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Default number of samples kept per backend
pub const DEFAULT_MAX_RETAINED: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Upload,
    Download,
    Delete,
    HealthCheck,
}

#[derive(Debug, Clone)]
struct Sample {
    kind: OperationKind,
    latency: Duration,
    success: bool,
}

#[derive(Debug, Default)]
struct BackendHistory {
    samples: VecDeque<Sample>,
    operations: u64,
    errors: u64,
    bytes_transferred: u64,
    last_operation_at: Option<DateTime<Utc>>,
}

impl BackendHistory {
    fn latency_percentile(&self, percentile: f64) -> Duration {
        let mut latencies: Vec<Duration> = self.samples.iter().map(|s| s.latency).collect();
        if latencies.is_empty() {
            return Duration::ZERO;
        }

        latencies.sort();
        let index = ((percentile / 100.0) * latencies.len() as f64) as usize;
        latencies[index.min(latencies.len() - 1)]
    }

    fn average_latency(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.samples.iter().map(|s| s.latency).sum();
        sum / self.samples.len() as u32
    }
}

/// Snapshot of one backend's recent behaviour
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub operations: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub bytes_transferred: u64,
    pub uploads: usize,
    pub downloads: usize,
    pub avg_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub last_operation_at: Option<DateTime<Utc>>,
}

/// Thread-safe metrics store keyed by backend name
///
/// Latency history is capped at `max_retained` samples per backend; the
/// counters are lifetime totals.
#[derive(Debug)]
pub struct MetricsRegistry {
    max_retained: usize,
    histories: Mutex<HashMap<String, BackendHistory>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETAINED)
    }
}

impl MetricsRegistry {
    pub fn new(max_retained: usize) -> Self {
        Self {
            max_retained: max_retained.max(1),
            histories: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(
        &self,
        backend: &str,
        kind: OperationKind,
        latency: Duration,
        bytes: u64,
        success: bool,
    ) {
        let mut histories = self.histories.lock().unwrap();
        let history = histories.entry(backend.to_string()).or_default();

        history.operations += 1;
        if success {
            history.bytes_transferred += bytes;
        } else {
            history.errors += 1;
        }
        history.last_operation_at = Some(Utc::now());

        history.samples.push_back(Sample {
            kind,
            latency,
            success,
        });
        while history.samples.len() > self.max_retained {
            history.samples.pop_front();
        }
    }

    pub fn summary(&self, backend: &str) -> Option<MetricsSummary> {
        let histories = self.histories.lock().unwrap();
        histories.get(backend).map(summarize)
    }

    #[cfg(test)]
    fn retained(&self, backend: &str) -> usize {
        self.histories
            .lock()
            .unwrap()
            .get(backend)
            .map_or(0, |h| h.samples.len())
    }

    /// Forget a backend's history
    pub fn reset(&self, backend: &str) {
        self.histories.lock().unwrap().remove(backend);
    }

    pub fn reset_all(&self) {
        self.histories.lock().unwrap().clear();
    }
}

fn summarize(history: &BackendHistory) -> MetricsSummary {
    let count = |kind: OperationKind| {
        history
            .samples
            .iter()
            .filter(|s| s.kind == kind && s.success)
            .count()
    };

    MetricsSummary {
        operations: history.operations,
        errors: history.errors,
        error_rate: if history.operations == 0 {
            0.0
        } else {
            history.errors as f64 / history.operations as f64
        },
        bytes_transferred: history.bytes_transferred,
        uploads: count(OperationKind::Upload),
        downloads: count(OperationKind::Download),
        avg_latency_ms: history.average_latency().as_millis() as u64,
        p95_latency_ms: history.latency_percentile(95.0).as_millis() as u64,
        last_operation_at: history.last_operation_at,
    }
}
