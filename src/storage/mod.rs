// Multi-backend storage: failover bookkeeping, the fallback coordinator and
// the manager that ties them to configuration.

pub mod failover;
pub mod manager;
pub mod registry;

pub use failover::{
    BackendReport, FailoverCoordinator, FailoverDownload, FailoverReport, FailoverUpload,
};
pub use manager::{BackendStatsReport, StorageManager};
pub use registry::{BackendRegistry, FailoverPolicy, FailoverState};
