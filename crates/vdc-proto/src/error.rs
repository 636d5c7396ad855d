//! Error types for the vdc-proto crate.

use thiserror::Error;

use crate::job::JobState;

/// Errors raised while building or transitioning shared records.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtoError {
    /// A resource request was negative, non-finite or unparseable.
    #[error("invalid resource request: {0}")]
    InvalidResourceRequest(String),

    /// A job identifier was empty or malformed.
    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    /// A cluster identifier was empty or malformed.
    #[error("invalid cluster id: {0}")]
    InvalidClusterId(String),

    /// The requested lifecycle transition is not allowed.
    #[error("invalid state transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        /// Job being transitioned.
        job_id: String,
        /// Current state.
        from: JobState,
        /// Requested state.
        to: JobState,
    },

    /// Executor type string did not name a known backend.
    #[error("unknown executor type: {0}")]
    UnknownExecutorType(String),
}

/// Result type for proto operations.
pub type Result<T> = std::result::Result<T, ProtoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_display() {
        let err = ProtoError::InvalidTransition {
            job_id: "run-42".to_string(),
            from: JobState::Succeeded,
            to: JobState::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("run-42"));
        assert!(msg.contains("succeeded"));
        assert!(msg.contains("running"));
    }

    #[test]
    fn test_invalid_resource_display() {
        let err = ProtoError::InvalidResourceRequest("cpu cannot be negative".to_string());
        assert_eq!(
            err.to_string(),
            "invalid resource request: cpu cannot be negative"
        );
    }
}
