//! Executor trait and submission record.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use vdc_proto::{
    ClusterId, ExecutorHandle, ExecutorStatus, ExecutorType, Job, JobId, JobPayload,
    ResourceVector,
};

use crate::error::{ExecutorError, Result};

/// Longest backend object name (DNS-1123 label).
pub const MAX_EXTERNAL_NAME: usize = 63;

/// Everything an executor needs to start one attempt of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSubmission {
    /// Job identity.
    pub job_id: JobId,
    /// Owning cluster.
    pub cluster: ClusterId,
    /// Requested resources.
    pub resources: ResourceVector,
    /// What to run.
    pub payload: JobPayload,
    /// Zero-based dispatch attempt.
    pub attempt: u32,
}

impl JobSubmission {
    /// Build a submission for a job's next attempt.
    #[must_use]
    pub fn for_job(job: &Job, cluster: ClusterId) -> Self {
        Self {
            job_id: job.id.clone(),
            cluster,
            resources: job.resources,
            payload: job.payload.clone(),
            attempt: job.retries,
        }
    }

    /// Backend-safe object name, unique per attempt: `vdc-<job>-<attempt>`.
    ///
    /// The job ID is lower-cased, runs of characters outside `[a-z0-9]`
    /// become `-`, and the result is cut to [`MAX_EXTERNAL_NAME`].
    #[must_use]
    pub fn external_name(&self) -> String {
        let suffix = format!("-{}", self.attempt);
        let mut stem = String::with_capacity(self.job_id.as_str().len());
        for c in self.job_id.as_str().chars() {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                stem.push(c);
            } else if !stem.ends_with('-') {
                stem.push('-');
            }
        }
        let budget = MAX_EXTERNAL_NAME - "vdc-".len() - suffix.len();
        let stem: String = stem.trim_matches('-').chars().take(budget).collect();
        let stem = stem.trim_end_matches('-');
        if stem.is_empty() {
            format!("vdc-job{suffix}")
        } else {
            format!("vdc-{stem}{suffix}")
        }
    }
}

/// Backend adapter that launches, observes and stops jobs.
pub trait Executor: Send + Sync {
    /// Backend family.
    fn executor_type(&self) -> ExecutorType;

    /// Start a job and return its handle.
    fn submit<'a>(
        &'a self,
        submission: &'a JobSubmission,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorHandle>> + Send + 'a>>;

    /// Query a job's status.
    fn get_status<'a>(
        &'a self,
        handle: &'a ExecutorHandle,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorStatus>> + Send + 'a>>;

    /// Stop a job. Stopping a job the backend no longer knows succeeds.
    fn cancel<'a>(
        &'a self,
        handle: &'a ExecutorHandle,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Stop whatever an attempt may have started when its submit gave no
    /// answer.
    ///
    /// The default cancels the handle named by
    /// [`JobSubmission::external_name`], which is how backends that take our
    /// object name identify the job.
    fn abandon<'a>(
        &'a self,
        submission: &'a JobSubmission,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let handle = ExecutorHandle::new(self.executor_type(), submission.external_name());
            self.cancel(&handle).await
        })
    }
}

/// Time-bounded variants of the [`Executor`] calls.
pub trait ExecutorExt: Executor {
    /// [`Executor::submit`] bounded by `timeout`.
    fn submit_within<'a>(
        &'a self,
        submission: &'a JobSubmission,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorHandle>> + Send + 'a>> {
        Box::pin(async move {
            tokio::time::timeout(timeout, self.submit(submission))
                .await
                .unwrap_or_else(|_| {
                    Err(ExecutorError::Timeout {
                        operation: format!("submit of job {}", submission.job_id),
                        timeout,
                    })
                })
        })
    }

    /// [`Executor::get_status`] bounded by `timeout`.
    fn status_within<'a>(
        &'a self,
        handle: &'a ExecutorHandle,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorStatus>> + Send + 'a>> {
        Box::pin(async move {
            tokio::time::timeout(timeout, self.get_status(handle))
                .await
                .unwrap_or_else(|_| {
                    Err(ExecutorError::Timeout {
                        operation: format!("status query for {handle}"),
                        timeout,
                    })
                })
        })
    }

    /// [`Executor::cancel`] bounded by `timeout`.
    fn cancel_within<'a>(
        &'a self,
        handle: &'a ExecutorHandle,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            tokio::time::timeout(timeout, self.cancel(handle))
                .await
                .unwrap_or_else(|_| {
                    Err(ExecutorError::Timeout {
                        operation: format!("cancel of {handle}"),
                        timeout,
                    })
                })
        })
    }

    /// [`Executor::abandon`] bounded by `timeout`.
    fn abandon_within<'a>(
        &'a self,
        submission: &'a JobSubmission,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            tokio::time::timeout(timeout, self.abandon(submission))
                .await
                .unwrap_or_else(|_| {
                    Err(ExecutorError::Timeout {
                        operation: format!("abandon of {}", submission.external_name()),
                        timeout,
                    })
                })
        })
    }
}

impl<T: Executor + ?Sized> ExecutorExt for T {}
