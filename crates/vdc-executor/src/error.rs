//! Error types for executors.

use std::time::Duration;

use thiserror::Error;
use vdc_backend::BackendError;
use vdc_proto::ExecutorType;

/// Errors raised by executors and the executor registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutorError {
    /// No executor of this type is registered.
    #[error("no executor configured for {0}")]
    ExecutorNotConfigured(ExecutorType),

    /// The backend refused or failed to start the job.
    #[error("submit of job {job_id} failed: {reason}")]
    SubmitFailed {
        /// Job being submitted.
        job_id: String,
        /// Failure reason.
        reason: String,
    },

    /// The backend could not report a job's status.
    #[error("status query for {handle} failed: {reason}")]
    StatusFailed {
        /// Handle queried.
        handle: String,
        /// Failure reason.
        reason: String,
    },

    /// The backend could not cancel a job.
    #[error("cancel of {handle} failed: {reason}")]
    CancelFailed {
        /// Handle cancelled.
        handle: String,
        /// Failure reason.
        reason: String,
    },

    /// A backend call did not finish in time.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Bound that was exceeded.
        timeout: Duration,
    },

    /// Executor configuration was invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A REST client failed before reaching the backend.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, ExecutorError>;
