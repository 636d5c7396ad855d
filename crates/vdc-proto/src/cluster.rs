//! Cluster identity and executor types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};

/// Maximum length of a cluster or job identifier.
pub const MAX_ID_LENGTH: usize = 253;

/// Identifier of a cluster scope (one unit of quota accounting).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterId(String);

impl ClusterId {
    /// Create a cluster ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is empty, too long, or contains whitespace
    /// or control characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_identifier(&id).map_err(ProtoError::InvalidClusterId)?;
        Ok(Self(id))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ClusterId {
    type Error = ProtoError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ClusterId> for String {
    fn from(id: ClusterId) -> Self {
        id.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared validation for externally supplied identifiers.
pub(crate) fn validate_identifier(id: &str) -> std::result::Result<(), String> {
    if id.is_empty() {
        return Err("identifier cannot be empty".to_string());
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(format!(
            "identifier exceeds {MAX_ID_LENGTH} characters: {}",
            id.len()
        ));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("identifier contains whitespace or control characters: {id:?}"));
    }
    Ok(())
}

/// Backend family that runs jobs for a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorType {
    /// Kubernetes `batch/v1` Jobs.
    Kubernetes,
    /// Slurm batch jobs via `slurmrestd`.
    Slurm,
    /// Child processes on the scheduler host.
    Local,
}

impl ExecutorType {
    /// All known executor types.
    pub const ALL: [Self; 3] = [Self::Kubernetes, Self::Slurm, Self::Local];

    /// Lowercase name used in configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Kubernetes => "kubernetes",
            Self::Slurm => "slurm",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorType {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            "slurm" => Ok(Self::Slurm),
            "local" => Ok(Self::Local),
            other => Err(ProtoError::UnknownExecutorType(other.to_string())),
        }
    }
}
