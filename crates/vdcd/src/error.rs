//! Daemon error types.

use thiserror::Error;
use vdc_backend::BackendError;
use vdc_executor::ExecutorError;
use vdc_quota::QuotaError;
use vdc_scheduler::SchedulerError;

/// Errors raised while assembling or running the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration file problem.
    #[error("configuration error: {0}")]
    Config(String),

    /// Job file problem.
    #[error("job file error: {0}")]
    Jobs(String),

    /// REST client could not be built.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Quota provider setup failed.
    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// Executor setup failed.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Scheduler setup or submission failed.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;
