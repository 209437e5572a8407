/// Retry execution with configurable backoff and classified retryability
///
/// `RetryExecutor::retry` runs an async operation up to `max_retries + 1`
/// times. Between attempts it sleeps for an exponential (or linear) delay,
/// clamped to `max_delay_ms` and optionally stretched by up to 10% jitter.
/// A failure whose kind is not retryable, or that is flagged permanent by the
/// classifier, ends the loop immediately.
use super::classification::{ErrorClassifier, ErrorKind};
use crate::{StorageError, StorageResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// Maximum share of the computed delay added as random jitter
const JITTER_FACTOR: f64 = 0.1;

/// Named retry presets for different call sites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPreset {
    /// Few quick retries for interactive calls
    Fast,

    /// Default: 3 retries, 1s base, 30s cap, x2 backoff
    Standard,

    /// Many short retries for cheap idempotent calls
    Aggressive,

    /// Few slow retries for expensive or billable calls
    Conservative,
}

impl RetryPreset {
    pub fn config(&self) -> RetryConfig {
        match self {
            RetryPreset::Fast => RetryConfig {
                max_retries: 2,
                base_delay_ms: 500,
                max_delay_ms: 5_000,
                backoff_multiplier: 1.5,
                attempt_timeout_ms: Some(15_000),
                ..RetryConfig::default()
            },
            RetryPreset::Standard => RetryConfig::default(),
            RetryPreset::Aggressive => RetryConfig {
                max_retries: 5,
                base_delay_ms: 500,
                max_delay_ms: 10_000,
                backoff_multiplier: 1.5,
                attempt_timeout_ms: Some(30_000),
                ..RetryConfig::default()
            },
            RetryPreset::Conservative => RetryConfig {
                max_retries: 2,
                base_delay_ms: 2_000,
                max_delay_ms: 60_000,
                backoff_multiplier: 3.0,
                attempt_timeout_ms: Some(120_000),
                ..RetryConfig::default()
            },
        }
    }
}

impl FromStr for RetryPreset {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(RetryPreset::Fast),
            "standard" => Ok(RetryPreset::Standard),
            "aggressive" => Ok(RetryPreset::Aggressive),
            "conservative" => Ok(RetryPreset::Conservative),
            other => Err(StorageError::Config(format!("unknown retry preset: {}", other))),
        }
    }
}

/// Per-call retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,

    pub base_delay_ms: u64,

    pub max_delay_ms: u64,

    pub backoff_multiplier: f64,

    /// Error kinds that may be retried
    pub retryable_kinds: HashSet<ErrorKind>,

    /// Add up to 10% random jitter to each delay
    pub jitter_enabled: bool,

    /// Exponential backoff when true, linear (`base * attempt`) otherwise
    pub exponential: bool,

    /// Deadline for a single attempt; `None` disables it
    pub attempt_timeout_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            retryable_kinds: default_retryable_kinds(),
            jitter_enabled: true,
            exponential: true,
            attempt_timeout_ms: Some(60_000),
        }
    }
}

fn default_retryable_kinds() -> HashSet<ErrorKind> {
    [
        ErrorKind::Network,
        ErrorKind::Server,
        ErrorKind::RateLimit,
        ErrorKind::Upload,
    ]
    .into_iter()
    .collect()
}

impl RetryConfig {
    pub fn preset(preset: RetryPreset) -> Self {
        preset.config()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay_ms = base_delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = max_delay.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter_enabled = enabled;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = kinds.into_iter().collect();
        self
    }

    /// Backoff delay before retrying after failed `attempt` (1-based), without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw_ms = if self.exponential {
            self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32 - 1)
        } else {
            self.base_delay_ms as f64 * attempt as f64
        };

        let capped_ms = raw_ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped_ms as u64)
    }

    /// Backoff delay including jitter when enabled
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter_enabled || delay.is_zero() {
            return delay;
        }

        let jitter_ms = rand::random::<f64>() * delay.as_millis() as f64 * JITTER_FACTOR;
        delay + Duration::from_millis(jitter_ms as u64)
    }

    /// Delay sequence a fully failing operation would observe
    pub fn delay_schedule(&self) -> Vec<Duration> {
        (1..=self.max_retries)
            .map(|attempt| self.delay_for_attempt(attempt))
            .collect()
    }

    fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }
}

/// One failed attempt that was followed by a retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    pub attempt: u32,
    pub delay_ms: u64,
    pub error_summary: Option<String>,
    pub kind: Option<ErrorKind>,
    /// Unix epoch milliseconds when the attempt failed
    pub timestamp_ms: i64,
}

/// Result of a retried operation
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<StorageError>,
    pub attempts_made: u32,
    pub total_time: Duration,
    pub history: Vec<RetryAttempt>,
}

impl<T> RetryOutcome<T> {
    pub fn total_time_ms(&self) -> u64 {
        self.total_time.as_millis() as u64
    }

    /// Convert into a plain result, re-raising the final error
    pub fn into_result(self) -> StorageResult<T> {
        match (self.data, self.error) {
            (Some(data), _) => Ok(data),
            (None, Some(error)) => Err(error),
            (None, None) => Err(StorageError::Other(
                "retry finished without a result".to_string(),
            )),
        }
    }
}

/// Runs operations with classified retries
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    classifier: ErrorClassifier,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self {
            classifier: ErrorClassifier::new(),
        }
    }

    /// Check whether `error` may be retried under `config`
    ///
    /// Budget is not considered here, only the nature of the failure.
    pub fn should_retry(&self, error: &StorageError, config: &RetryConfig) -> bool {
        let kind = self.classifier.classify(error);
        config.retryable_kinds.contains(&kind) && !self.classifier.is_non_retryable(error)
    }

    /// Run `operation` until it succeeds, fails permanently or exhausts the budget
    pub async fn retry<T, F, Fut>(
        &self,
        mut operation: F,
        name: &str,
        config: &RetryConfig,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let started = Instant::now();
        let max_attempts = config.max_retries + 1;
        let mut history = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match config.attempt_timeout() {
                Some(deadline) => match tokio::time::timeout(deadline, operation()).await {
                    Ok(result) => result,
                    Err(_) => Err(StorageError::Timeout(format!(
                        "{} attempt {} exceeded {}ms",
                        name,
                        attempt,
                        deadline.as_millis()
                    ))),
                },
                None => operation().await,
            };

            let error = match result {
                Ok(data) => {
                    if attempt > 1 {
                        tracing::info!(
                            operation = name,
                            attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return RetryOutcome {
                        success: true,
                        data: Some(data),
                        error: None,
                        attempts_made: attempt,
                        total_time: started.elapsed(),
                        history,
                    };
                }
                Err(error) => error,
            };

            let kind = self.classifier.classify(&error);

            if !self.should_retry(&error, config) {
                tracing::warn!(
                    operation = name,
                    attempt,
                    kind = %kind,
                    error = %error,
                    "Error is not retryable, giving up"
                );
                return self.failed(error, attempt, started, history);
            }

            if attempt >= max_attempts {
                tracing::error!(
                    operation = name,
                    attempt,
                    max_attempts,
                    error = %error,
                    "Max retry attempts reached"
                );
                return self.failed(error, attempt, started, history);
            }

            let delay = config.next_delay(attempt);
            history.push(RetryAttempt {
                attempt,
                delay_ms: delay.as_millis() as u64,
                error_summary: Some(format!("{}: {}", kind, error)),
                kind: Some(kind),
                timestamp_ms: Utc::now().timestamp_millis(),
            });

            tracing::info!(
                operation = name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                remaining = max_attempts - attempt,
                kind = %kind,
                "Retrying after delay"
            );

            tokio::time::sleep(delay).await;
        }
    }

    fn failed<T>(
        &self,
        error: StorageError,
        attempts_made: u32,
        started: Instant,
        history: Vec<RetryAttempt>,
    ) -> RetryOutcome<T> {
        RetryOutcome {
            success: false,
            data: None,
            error: Some(error),
            attempts_made,
            total_time: started.elapsed(),
            history,
        }
    }
}
