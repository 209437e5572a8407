// Allow complex types where needed for retry/upload callback signatures
#![allow(clippy::type_complexity)]

pub mod backends;
pub mod config;
pub mod metrics;
pub mod recovery;
pub mod storage;

// Re-export the two composition roots for convenience
pub use recovery::RecoveryManager;
pub use storage::StorageManager;

pub use backends::{
    BackendDescriptor, BackendKind, BackendStats, DownloadedObject, HealthStatus, ObjectInfo,
    StorageBackend, UploadOptions, UploadOutcome,
};
pub use config::StorageSettings;
pub use recovery::classification::{ErrorClassifier, ErrorKind, ErrorReport};

use thiserror::Error;

// Crate-wide error type. Every failure surfaced to callers carries enough
// information to be classified into an `ErrorKind`.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("storage manager is not initialized")]
    NotInitialized,

    #[error("no storage backends available")]
    NoBackendsAvailable,

    #[error("unknown storage backend: {0}")]
    UnknownBackend(String),

    #[error("storage backend {0} is currently unavailable")]
    BackendUnavailable(String),

    #[error("all {attempts} storage backends failed; last error: {last_error}")]
    AllBackendsFailed {
        attempts: usize,
        last_error: String,
        last_kind: ErrorKind,
    },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("network error ({code}): {message}")]
    Network { code: String, message: String },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("network did not recover within {waited_ms}ms")]
    NetworkUnavailable { waited_ms: u64 },

    #[error("I/O error: {message}")]
    Io {
        kind: std::io::ErrorKind,
        code: Option<String>,
        message: String,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("upload session not found: {0}")]
    SessionNotFound(String),

    #[error("session store error: {0}")]
    SessionStore(String),

    #[error("{operation} failed after {attempts} attempts in {elapsed_ms}ms: {message}")]
    RecoveryFailed {
        operation: String,
        attempts: u32,
        elapsed_ms: u64,
        kind: ErrorKind,
        message: String,
    },

    #[error("{0}")]
    Other(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Coarse category used by retry and recovery policies
    pub fn kind(&self) -> ErrorKind {
        ErrorClassifier::new().classify(self)
    }

    /// Structured `{kind, message}` pair for callers that render errors
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        StorageError::Http {
            status,
            message: message.into(),
        }
    }

    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::Network {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
            || matches!(self, StorageError::Io { kind, .. } if *kind == std::io::ErrorKind::NotFound)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;

        let code = match err.kind() {
            IoKind::NotFound => Some("ENOENT"),
            IoKind::PermissionDenied => Some("EACCES"),
            IoKind::ConnectionRefused => Some("ECONNREFUSED"),
            IoKind::ConnectionReset => Some("ECONNRESET"),
            IoKind::ConnectionAborted => Some("ECONNABORTED"),
            IoKind::TimedOut => Some("ETIMEDOUT"),
            IoKind::BrokenPipe => Some("EPIPE"),
            IoKind::NotConnected => Some("ENOTCONN"),
            IoKind::AddrNotAvailable => Some("EADDRNOTAVAIL"),
            _ => None,
        };

        StorageError::Io {
            kind: err.kind(),
            code: code.map(str::to_string),
            message: err.to_string(),
        }
    }
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => StorageError::NotFound { key: path },
            object_store::Error::Generic { store, source } => {
                StorageError::Other(format!("{} store error: {}", store, source))
            }
            other => StorageError::Other(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::SessionStore(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Other(format!("serialization error: {}", err))
    }
}

impl From<anyhow::Error> for StorageError {
    fn from(err: anyhow::Error) -> Self {
        // External failures are classified from their message text
        StorageError::Other(err.to_string())
    }
}

#[cfg(test)]
mod lib_tests;
