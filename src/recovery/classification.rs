/// Error classification for retry and recovery strategy selection
///
/// Every failure is mapped onto one coarse `ErrorKind`. Typed `StorageError`
/// variants map directly; errors that originate outside this crate (HTTP
/// responses, raw I/O, anything wrapped in `StorageError::Other`) are
/// classified from their code, status and message text.
use crate::StorageError;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Connection refused, DNS failure, timeouts
    Network,

    /// HTTP 5xx from a backend
    Server,

    /// HTTP 401 or rejected credentials
    Authentication,

    /// HTTP 403
    Permission,

    /// HTTP 400 or a request this crate refuses to send
    Validation,

    /// Upload-specific failures (multipart, size limits)
    Upload,

    /// HTTP 429 or explicit throttling
    RateLimit,

    /// Local filesystem failures and missing objects
    File,

    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::Network,
        ErrorKind::Server,
        ErrorKind::Authentication,
        ErrorKind::Permission,
        ErrorKind::Validation,
        ErrorKind::Upload,
        ErrorKind::RateLimit,
        ErrorKind::File,
        ErrorKind::Unknown,
    ];

    /// Get human-readable description of the category
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::Network => "Network connectivity problem",
            ErrorKind::Server => "Storage provider server error",
            ErrorKind::Authentication => "Credentials were rejected",
            ErrorKind::Permission => "Access to the resource is forbidden",
            ErrorKind::Validation => "Request was invalid",
            ErrorKind::Upload => "Upload could not be completed",
            ErrorKind::RateLimit => "Too many requests, provider is throttling",
            ErrorKind::File => "File is missing or inaccessible",
            ErrorKind::Unknown => "Unclassified error",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Server => "server",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Permission => "permission",
            ErrorKind::Validation => "validation",
            ErrorKind::Upload => "upload",
            ErrorKind::RateLimit => "rateLimit",
            ErrorKind::File => "file",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error handed to callers that need to render a failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

/// Raw facts about a failure, used when no typed variant decides the kind
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorSignature<'a> {
    /// Error code or name (`ECONNREFUSED`, `TimeoutError`, ...)
    pub code: Option<&'a str>,

    /// HTTP status code, if the failure came from an HTTP response
    pub status: Option<u16>,

    pub message: &'a str,
}

impl<'a> ErrorSignature<'a> {
    pub fn from_message(message: &'a str) -> Self {
        Self {
            code: None,
            status: None,
            message,
        }
    }
}

const NETWORK_CODES: &[&str] = &[
    "ECONNREFUSED",
    "ECONNRESET",
    "ECONNABORTED",
    "ENOTFOUND",
    "EAI_AGAIN",
    "ETIMEDOUT",
    "ESOCKETTIMEDOUT",
    "EHOSTUNREACH",
    "ENETUNREACH",
    "ENETDOWN",
    "ENOTCONN",
    "EPIPE",
    "EADDRNOTAVAIL",
    "NETWORKERROR",
    "TIMEOUTERROR",
    "ABORTERROR",
];

const FILE_CODES: &[&str] = &["ENOENT", "EACCES", "EISDIR", "ENOTDIR", "EPERM", "EEXIST"];

const UPLOAD_KEYWORDS: &[&str] = &[
    "upload",
    "file size",
    "file too large",
    "payload too large",
    "multipart",
    "entity too large",
];

const RATE_LIMIT_KEYWORDS: &[&str] = &["rate limit", "too many requests", "slow down", "throttl"];

const NETWORK_KEYWORDS: &[&str] = &[
    "network",
    "connection refused",
    "connection reset",
    "connection closed",
    "dns error",
    "failed to lookup address",
    "timed out",
    "timeout",
    "unreachable",
    "error sending request",
];

const FILE_KEYWORDS: &[&str] = &[
    "no such file",
    "is a directory",
    "not a directory",
    "access denied",
    "file not found",
];

/// Messages that mark a failure as permanent whatever its category
const NON_RETRYABLE_MESSAGES: &[&str] = &[
    "file too large",
    "unsupported format",
    "unsupported file type",
    "invalid credentials",
    "account suspended",
];

lazy_static! {
    static ref STATUS_FIELD: Regex =
        Regex::new(r"(?i)\bstatus(?:\s*code)?\s*[:=]?\s*(\d{3})\b").expect("valid status regex");
    static ref HTTP_STATUS_PHRASE: Regex =
        Regex::new(r"(?i)HTTP status (?:client|server) error \((\d{3})").expect("valid HTTP regex");
}

/// Extract an HTTP status code embedded in an error message
///
/// object_store and reqwest render statuses as either `status: 503` or
/// `HTTP status server error (503 Service Unavailable)`.
pub fn status_from_message(message: &str) -> Option<u16> {
    HTTP_STATUS_PHRASE
        .captures(message)
        .or_else(|| STATUS_FIELD.captures(message))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .filter(|status| (100..=599).contains(status))
}

/// Error classifier - determines the `ErrorKind` for any failure
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a crate error
    pub fn classify(&self, error: &StorageError) -> ErrorKind {
        match error {
            StorageError::NotFound { .. } => ErrorKind::File,
            StorageError::NotInitialized
            | StorageError::UnknownBackend(_)
            | StorageError::Config(_)
            | StorageError::SessionNotFound(_)
            | StorageError::Validation(_) => ErrorKind::Validation,
            StorageError::NoBackendsAvailable | StorageError::BackendUnavailable(_) => {
                ErrorKind::Server
            }
            StorageError::AllBackendsFailed { last_kind, .. } => *last_kind,
            StorageError::RecoveryFailed { kind, .. } => *kind,
            StorageError::Network { .. }
            | StorageError::Timeout(_)
            | StorageError::NetworkUnavailable { .. } => ErrorKind::Network,
            StorageError::Authentication(_) => ErrorKind::Authentication,
            StorageError::PermissionDenied(_) => ErrorKind::Permission,
            StorageError::RateLimited(_) => ErrorKind::RateLimit,
            StorageError::Upload(_) => ErrorKind::Upload,
            StorageError::Http { status, message } => self.classify_signature(&ErrorSignature {
                code: None,
                status: Some(*status),
                message,
            }),
            StorageError::Io { code, message, .. } => self.classify_signature(&ErrorSignature {
                code: code.as_deref(),
                status: None,
                message,
            }),
            StorageError::SessionStore(message) | StorageError::Other(message) => {
                self.classify_signature(&ErrorSignature {
                    code: None,
                    status: status_from_message(message),
                    message,
                })
            }
        }
    }

    /// Classify raw failure facts. First match wins.
    pub fn classify_signature(&self, signature: &ErrorSignature<'_>) -> ErrorKind {
        let code = signature.code.map(|c| c.to_ascii_uppercase());
        let message = signature.message.to_ascii_lowercase();

        if let Some(code) = code.as_deref() {
            if NETWORK_CODES.contains(&code) {
                return ErrorKind::Network;
            }
        }

        if let Some(status) = signature.status {
            match status {
                500..=599 => return ErrorKind::Server,
                401 => return ErrorKind::Authentication,
                403 => return ErrorKind::Permission,
                400 => return ErrorKind::Validation,
                408 => return ErrorKind::Network,
                429 => return ErrorKind::RateLimit,
                _ => {}
            }
        }

        // Throttling wins over upload keywords ("upload rate limit exceeded")
        if contains_any(&message, RATE_LIMIT_KEYWORDS) {
            return ErrorKind::RateLimit;
        }

        if contains_any(&message, UPLOAD_KEYWORDS) {
            return ErrorKind::Upload;
        }

        if let Some(code) = code.as_deref() {
            if FILE_CODES.contains(&code) {
                return ErrorKind::File;
            }
        }

        if contains_any(&message, NETWORK_KEYWORDS) {
            return ErrorKind::Network;
        }

        if contains_any(&message, FILE_KEYWORDS) {
            return ErrorKind::File;
        }

        ErrorKind::Unknown
    }

    /// Check whether an error must never be retried, whatever its kind
    ///
    /// Any 4xx other than 408 and 429 is permanent, as are a handful of
    /// provider messages that no amount of waiting will fix.
    pub fn is_non_retryable(&self, error: &StorageError) -> bool {
        let status = match error {
            StorageError::Http { status, .. } => Some(*status),
            StorageError::Other(message) => status_from_message(message),
            _ => None,
        };

        if let Some(status) = status {
            if (400..500).contains(&status) && status != 408 && status != 429 {
                return true;
            }
        }

        let message = error.to_string().to_ascii_lowercase();
        contains_any(&message, NON_RETRYABLE_MESSAGES)
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}
