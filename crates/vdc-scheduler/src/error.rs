//! Error types for the scheduler.

use thiserror::Error;
use vdc_executor::ExecutorError;
use vdc_proto::{ClusterId, ExecutorType, JobId, JobState, ProtoError, ResourceVector};
use vdc_quota::QuotaError;

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors raised by the scheduler core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// No job with this id is tracked.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// A job with this id is already tracked.
    #[error("duplicate job: {0}")]
    DuplicateJob(JobId),

    /// The job is already terminal.
    #[error("cannot cancel job {job_id} in state {state}")]
    CannotCancel {
        /// Job that was asked to cancel.
        job_id: JobId,
        /// Its current state.
        state: JobState,
    },

    /// No candidate cluster has room for the request.
    #[error("no cluster has capacity for {request}")]
    NoCapacity {
        /// Requested resources.
        request: ResourceVector,
    },

    /// No registered cluster runs this executor type.
    #[error("no cluster is registered for executor type {0}")]
    NoEligibleCluster(ExecutorType),

    /// The cluster is not registered.
    #[error("unknown cluster: {0}")]
    UnknownCluster(ClusterId),

    /// The cluster is already registered.
    #[error("cluster already registered: {0}")]
    DuplicateCluster(ClusterId),

    /// Scheduler configuration is invalid.
    #[error("invalid scheduler configuration: {0}")]
    Config(String),

    /// Invalid request or lifecycle violation.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// Quota provider failure.
    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// Executor failure.
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_id() -> JobId {
        JobId::new("train-42").unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn error_display_job_not_found() {
        assert_eq!(
            SchedulerError::JobNotFound(job_id()).to_string(),
            "job not found: train-42"
        );
    }

    #[test]
    fn error_display_cannot_cancel() {
        let err = SchedulerError::CannotCancel {
            job_id: job_id(),
            state: JobState::Succeeded,
        };
        assert_eq!(err.to_string(), "cannot cancel job train-42 in state succeeded");
    }

    #[test]
    fn error_display_no_eligible_cluster() {
        let err = SchedulerError::NoEligibleCluster(ExecutorType::Slurm);
        assert!(err.to_string().contains("slurm"));
    }

    #[test]
    fn error_from_executor_is_transparent() {
        let inner = ExecutorError::ExecutorNotConfigured(ExecutorType::Kubernetes);
        let err: SchedulerError = inner.clone().into();
        assert_eq!(err.to_string(), inner.to_string());
        assert!(matches!(err, SchedulerError::Executor(_)));
    }

    #[test]
    fn error_from_quota() {
        let scope = ClusterId::new("east").unwrap_or_else(|_| unreachable!());
        let err: SchedulerError = QuotaError::UnknownScope(scope).into();
        assert!(matches!(err, SchedulerError::Quota(QuotaError::UnknownScope(_))));
    }
}
