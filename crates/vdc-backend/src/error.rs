//! Error types for the backend REST clients.

use thiserror::Error;

/// Errors raised while talking to a Kubernetes API server or `slurmrestd`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Client configuration was incomplete or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The kubeconfig file could not be read or resolved.
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// The request never produced a response (connect, TLS, timeout).
    #[error("HTTP request to {url} failed: {reason}")]
    Http {
        /// Request URL.
        url: String,
        /// Transport failure.
        reason: String,
    },

    /// The server answered with a non-success status.
    #[error("{url} returned {status}: {body}")]
    Status {
        /// Request URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The response body did not match the expected shape.
    #[error("failed to decode response from {url}: {reason}")]
    Decode {
        /// Request URL.
        url: String,
        /// Decoder message.
        reason: String,
    },
}

impl BackendError {
    /// Check if the server reported the object as missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }

    /// Check if retrying the same request later could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Http { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> BackendError {
        BackendError::Status {
            url: "https://k8s.local/api".to_string(),
            status: code,
            body: String::new(),
        }
    }

    #[test]
    fn test_not_found() {
        assert!(status(404).is_not_found());
        assert!(!status(500).is_not_found());
    }

    #[test]
    fn test_transient() {
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(403).is_transient());
        assert!(!BackendError::Config("missing url".to_string()).is_transient());
    }

    #[test]
    fn test_status_display() {
        let msg = status(409).to_string();
        assert!(msg.contains("409"));
        assert!(msg.contains("k8s.local"));
    }
}
