// Error classification, retries, network tracking and resumable uploads

pub mod classification;
pub mod coordinator;
pub mod network;
pub mod retry;
pub mod sessions;

pub use classification::{ErrorClassifier, ErrorKind, ErrorReport};
pub use coordinator::{
    FileRecoveryOptions, FileRecoveryOutcome, RecoveryManager, RecoveryOptions,
    RecoveryStrategy, UploadFile,
};
pub use network::{
    ConnectivityProbe, EffectiveType, HttpProbe, NetworkEvent, NetworkMonitor, NetworkQuality,
    NetworkStatus, ProbeResult, TcpProbe,
};
pub use retry::{RetryAttempt, RetryConfig, RetryExecutor, RetryOutcome, RetryPreset};
pub use sessions::{
    ResumeOutcome, ResumePoint, SessionDatabase, SessionStatus, UploadSession,
    UploadSessionTracker,
};
