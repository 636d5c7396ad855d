//! Error types for quota providers.

use thiserror::Error;
use vdc_proto::{ClusterId, ResourceVector};

/// Errors raised by quota providers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuotaError {
    /// The request does not fit in the scope's available capacity.
    #[error("quota exceeded on {scope}: requested {requested}, available {available}")]
    QuotaExceeded {
        /// Scope checked.
        scope: ClusterId,
        /// Requested resources.
        requested: ResourceVector,
        /// Capacity still available.
        available: ResourceVector,
    },

    /// The scope is not managed by this provider.
    #[error("unknown quota scope: {0}")]
    UnknownScope(ClusterId),

    /// The backend could not be reached, or its data is too old to trust.
    #[error("quota backend unavailable for {scope}: {reason}")]
    BackendUnavailable {
        /// Scope affected.
        scope: ClusterId,
        /// What went wrong.
        reason: String,
    },

    /// Limits were malformed or the backend reported unusable quota data.
    #[error("invalid quota: {0}")]
    InvalidQuota(String),
}

impl QuotaError {
    /// Check if the condition is expected to clear on its own.
    ///
    /// `QuotaExceeded` clears when reservations are released;
    /// `BackendUnavailable` clears when the backend comes back.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded { .. } | Self::BackendUnavailable { .. }
        )
    }
}

/// Result type for quota operations.
pub type Result<T> = std::result::Result<T, QuotaError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> ClusterId {
        ClusterId::new("gpu-east").unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn test_retryable() {
        let exceeded = QuotaError::QuotaExceeded {
            scope: scope(),
            requested: ResourceVector::ZERO.with_gpu(2),
            available: ResourceVector::ZERO,
        };
        assert!(exceeded.is_retryable());
        assert!(!QuotaError::UnknownScope(scope()).is_retryable());
        assert!(!QuotaError::InvalidQuota("negative cpu".to_string()).is_retryable());
    }

    #[test]
    fn test_exceeded_display() {
        let err = QuotaError::QuotaExceeded {
            scope: scope(),
            requested: ResourceVector::ZERO.with_gpu(2),
            available: ResourceVector::ZERO,
        };
        let msg = err.to_string();
        assert!(msg.contains("gpu-east"));
        assert!(msg.contains("gpu=2"));
    }
}
