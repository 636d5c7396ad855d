//! Job records and their lifecycle.
//!
//! ```text
//!  Queued ──► Scheduled ──► Running ──► Succeeded
//!    │  ▲         │  │          │
//!    │  └─retry───┘  │          ├──────► Failed
//!    │               ├──────────┼──────► Failed (retries exhausted)
//!    └───────────────┴──────────┴──────► Cancelled
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::{validate_identifier, ClusterId, ExecutorType};
use crate::error::{ProtoError, Result};
use crate::resources::ResourceVector;

/// Identifier supplied by the external collaborator for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Create a job ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is empty, too long, or contains whitespace
    /// or control characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_identifier(&id).map_err(ProtoError::InvalidJobId)?;
        Ok(Self(id))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JobId {
    type Error = ProtoError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in a cluster queue for admission.
    Queued,
    /// Quota reserved; dispatch to the executor in flight.
    Scheduled,
    /// Accepted by the executor.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error, or dispatch retries were exhausted.
    Failed,
    /// Cancelled by the collaborator.
    Cancelled,
}

impl JobState {
    /// Check if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Check if a job in this state holds a quota reservation.
    #[must_use]
    pub const fn holds_reservation(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }

    /// Check if the transition `self -> to` is allowed.
    #[must_use]
    pub const fn can_transition_to(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Queued, Self::Scheduled | Self::Cancelled)
                | (
                    Self::Scheduled,
                    Self::Running | Self::Queued | Self::Failed | Self::Cancelled
                )
                | (
                    Self::Running,
                    Self::Succeeded | Self::Failed | Self::Cancelled
                )
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Backend-specific reference to a dispatched job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutorHandle {
    /// Backend that owns the job.
    pub executor_type: ExecutorType,
    /// Backend job name or number.
    pub external_id: String,
    /// Namespace, partition or working directory, when the backend has one.
    pub location: Option<String>,
}

impl ExecutorHandle {
    /// Create a handle.
    #[must_use]
    pub fn new(executor_type: ExecutorType, external_id: impl Into<String>) -> Self {
        Self {
            executor_type,
            external_id: external_id.into(),
            location: None,
        }
    }

    /// Set the backend location.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl fmt::Display for ExecutorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{}:{}/{}", self.executor_type, location, self.external_id),
            None => write!(f, "{}:{}", self.executor_type, self.external_id),
        }
    }
}

/// Status reported by an executor for a dispatched job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum ExecutorStatus {
    /// Pending or running on the backend.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Completed with an error.
    Failed(String),
}

impl ExecutorStatus {
    /// Check if the backend considers the job finished.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// What the executor should run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobPayload {
    /// Container image (Kubernetes).
    pub image: Option<String>,
    /// Command and arguments.
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub working_dir: Option<String>,
}

impl JobPayload {
    /// Create a payload running `command`.
    #[must_use]
    pub fn command<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the container image.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// A submission from the external collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Job identity.
    pub id: JobId,
    /// Requested resources.
    pub resources: ResourceVector,
    /// Higher is more urgent.
    #[serde(default)]
    pub priority: i32,
    /// Preferred executor backend.
    pub executor_type: ExecutorType,
    /// Cluster to try first, if any.
    #[serde(default)]
    pub cluster_hint: Option<ClusterId>,
    /// What to run.
    #[serde(default)]
    pub payload: JobPayload,
}

impl JobRequest {
    /// Create a request with default priority and an empty payload.
    #[must_use]
    pub fn new(id: JobId, resources: ResourceVector, executor_type: ExecutorType) -> Self {
        Self {
            id,
            resources,
            priority: 0,
            executor_type,
            cluster_hint: None,
            payload: JobPayload::default(),
        }
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set a cluster hint.
    #[must_use]
    pub fn with_cluster_hint(mut self, cluster: ClusterId) -> Self {
        self.cluster_hint = Some(cluster);
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: JobPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Validate the request.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::InvalidResourceRequest`] for bad resources.
    pub fn validate(&self) -> Result<()> {
        self.resources.validate()
    }
}

/// One entry in a job's lifecycle history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state; `None` for the initial entry.
    pub from: Option<JobState>,
    /// New state.
    pub to: JobState,
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Why, when there is something worth recording.
    pub reason: Option<String>,
}

/// A job in the scheduler's working set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job identity.
    pub id: JobId,
    /// Requested resources.
    pub resources: ResourceVector,
    /// Higher is more urgent.
    pub priority: i32,
    /// When the job was submitted.
    pub submitted_at: DateTime<Utc>,
    /// Insertion order; strict tiebreaker for ordering policies.
    pub sequence: u64,
    /// Executor backend.
    pub executor_type: ExecutorType,
    /// Cluster hint from the submission.
    pub cluster_hint: Option<ClusterId>,
    /// Owning cluster, once enqueued.
    pub cluster: Option<ClusterId>,
    /// What to run.
    pub payload: JobPayload,
    /// Current lifecycle state.
    pub state: JobState,
    /// Last error, if any.
    pub error: Option<String>,
    /// Executor handle once dispatched.
    pub handle: Option<ExecutorHandle>,
    /// Failed dispatch attempts so far.
    pub retries: u32,
    /// Lifecycle history, oldest first.
    pub history: Vec<StateTransition>,
}

impl Job {
    /// Build a queued job from a submission.
    #[must_use]
    pub fn from_request(request: JobRequest, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id: request.id,
            resources: request.resources,
            priority: request.priority,
            submitted_at,
            sequence: 0,
            executor_type: request.executor_type,
            cluster_hint: request.cluster_hint,
            cluster: None,
            payload: request.payload,
            state: JobState::Queued,
            error: None,
            handle: None,
            retries: 0,
            history: vec![StateTransition {
                from: None,
                to: JobState::Queued,
                at: submitted_at,
                reason: None,
            }],
        }
    }

    /// Check if the job is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move the job to `to`, recording the transition.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::InvalidTransition`] if the lifecycle forbids it.
    pub fn transition_to(&mut self, to: JobState, reason: Option<String>) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(ProtoError::InvalidTransition {
                job_id: self.id.to_string(),
                from: self.state,
                to,
            });
        }
        self.history.push(StateTransition {
            from: Some(self.state),
            to,
            at: Utc::now(),
            reason,
        });
        self.state = to;
        Ok(())
    }

    /// Read-only status view.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id.clone(),
            state: self.state,
            cluster: self.cluster.clone(),
            handle: self.handle.clone(),
            error: self.error.clone(),
            retries: self.retries,
            submitted_at: self.submitted_at,
            history: self.history.clone(),
        }
    }
}

/// Status of a job as reported to the external collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Job identity.
    pub id: JobId,
    /// Current lifecycle state.
    pub state: JobState,
    /// Owning cluster.
    pub cluster: Option<ClusterId>,
    /// Executor handle, if dispatched.
    pub handle: Option<ExecutorHandle>,
    /// Failure reason or last dispatch error.
    pub error: Option<String>,
    /// Failed dispatch attempts.
    pub retries: u32,
    /// When the job was submitted.
    pub submitted_at: DateTime<Utc>,
    /// Lifecycle history.
    pub history: Vec<StateTransition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_job() -> Job {
        let id = JobId::new("train-resnet").unwrap_or_else(|_| unreachable!());
        let request = JobRequest::new(
            id,
            ResourceVector::ZERO.with_cpu(4.0).with_gpu(1),
            ExecutorType::Kubernetes,
        )
        .with_priority(5);
        Job::from_request(request, Utc::now())
    }

    // ==================== JobId ====================

    #[test]
    fn test_job_id_rejects_empty() {
        assert!(matches!(JobId::new(""), Err(ProtoError::InvalidJobId(_))));
    }

    // ==================== JobState ====================

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Scheduled.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn test_forward_transitions() {
        assert!(JobState::Queued.can_transition_to(JobState::Scheduled));
        assert!(JobState::Scheduled.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Succeeded));
        assert!(JobState::Running.can_transition_to(JobState::Failed));
    }

    #[test]
    fn test_dispatch_retry_transition() {
        assert!(JobState::Scheduled.can_transition_to(JobState::Queued));
        assert!(JobState::Scheduled.can_transition_to(JobState::Failed));
    }

    #[test]
    fn test_backward_and_terminal_transitions_rejected() {
        assert!(!JobState::Running.can_transition_to(JobState::Queued));
        assert!(!JobState::Queued.can_transition_to(JobState::Running));
        assert!(!JobState::Queued.can_transition_to(JobState::Failed));
        for terminal in [JobState::Succeeded, JobState::Failed, JobState::Cancelled] {
            for to in [
                JobState::Queued,
                JobState::Scheduled,
                JobState::Running,
                JobState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(to), "{terminal} -> {to}");
            }
        }
    }

    #[test]
    fn test_holds_reservation() {
        assert!(JobState::Scheduled.holds_reservation());
        assert!(JobState::Running.holds_reservation());
        assert!(!JobState::Queued.holds_reservation());
    }

    // ==================== Job ====================

    #[test]
    fn test_job_from_request() {
        let job = make_job();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.priority, 5);
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].from.is_none());
    }

    #[test]
    fn test_job_transition_records_history() {
        let mut job = make_job();
        assert!(job.transition_to(JobState::Scheduled, None).is_ok());
        assert!(job
            .transition_to(JobState::Queued, Some("connection refused".to_string()))
            .is_ok());

        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.history.len(), 3);
        assert_eq!(job.history[2].from, Some(JobState::Scheduled));
        assert_eq!(job.history[2].reason.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_job_invalid_transition_leaves_state() {
        let mut job = make_job();
        let result = job.transition_to(JobState::Succeeded, None);
        assert!(matches!(result, Err(ProtoError::InvalidTransition { .. })));
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.history.len(), 1);
    }

    #[test]
    fn test_job_status_view() {
        let mut job = make_job();
        job.handle = Some(ExecutorHandle::new(ExecutorType::Kubernetes, "vdc-train").with_location("ml"));
        let status = job.status();
        assert_eq!(status.id.as_str(), "train-resnet");
        assert_eq!(status.state, JobState::Queued);
        assert_eq!(
            status.handle.map(|h| h.to_string()),
            Some("kubernetes:ml/vdc-train".to_string())
        );
    }

    #[test]
    fn test_request_validate_rejects_negative() {
        let id = JobId::new("bad").unwrap_or_else(|_| unreachable!());
        let request = JobRequest::new(
            id,
            ResourceVector::ZERO.with_cpu(-2.0),
            ExecutorType::Slurm,
        );
        assert!(matches!(
            request.validate(),
            Err(ProtoError::InvalidResourceRequest(_))
        ));
    }

    #[test]
    fn test_executor_status_serialization() {
        let json = serde_json::to_string(&ExecutorStatus::Failed("oom".to_string()))
            .unwrap_or_default();
        assert!(json.contains("failed"));
        assert!(json.contains("oom"));
        assert!(!ExecutorStatus::Running.is_finished());
        assert!(ExecutorStatus::Succeeded.is_finished());
    }
}
