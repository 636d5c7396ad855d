//! Slurm executor: batch jobs through `slurmrestd`.

use std::future::Future;
use std::pin::Pin;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use vdc_backend::{SlurmClient, SlurmJob};
use vdc_proto::{ExecutorHandle, ExecutorStatus, ExecutorType};

use crate::error::{ExecutorError, Result};
use crate::executor::{Executor, JobSubmission};

/// Default working directory for batch jobs.
pub const DEFAULT_WORKING_DIR: &str = "/tmp";

const RUNNING_STATES: [&str; 8] = [
    "PENDING",
    "RUNNING",
    "CONFIGURING",
    "COMPLETING",
    "SUSPENDED",
    "REQUEUED",
    "RESIZING",
    "STAGE_OUT",
];

const FAILED_STATES: [&str; 9] = [
    "FAILED",
    "CANCELLED",
    "TIMEOUT",
    "NODE_FAIL",
    "OUT_OF_MEMORY",
    "PREEMPTED",
    "BOOT_FAIL",
    "DEADLINE",
    "REVOKED",
];

/// Executor submitting Slurm batch jobs.
#[derive(Debug, Clone)]
pub struct SlurmExecutor {
    client: SlurmClient,
    partition: Option<String>,
    working_dir: String,
}

impl SlurmExecutor {
    /// Create an executor using the cluster's default partition.
    #[must_use]
    pub fn new(client: SlurmClient) -> Self {
        Self {
            client,
            partition: None,
            working_dir: DEFAULT_WORKING_DIR.to_string(),
        }
    }

    /// Submit to a specific partition.
    #[must_use]
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    /// Working directory for payloads that do not set one.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }
}

/// Quote a word for a POSIX shell.
fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Render the `job/submit` request body for a submission.
///
/// # Errors
///
/// `SubmitFailed` if the payload has no command.
pub fn submission_body(
    submission: &JobSubmission,
    partition: Option<&str>,
    default_working_dir: &str,
) -> Result<Value> {
    if submission.payload.command.is_empty() {
        return Err(ExecutorError::SubmitFailed {
            job_id: submission.job_id.to_string(),
            reason: "slurm jobs need a command".to_string(),
        });
    }

    let command_line = submission
        .payload
        .command
        .iter()
        .map(|w| shell_quote(w))
        .collect::<Vec<_>>()
        .join(" ");
    let script = format!("#!/bin/bash\nexec {command_line}\n");

    let mut environment: Vec<String> = vec!["PATH=/usr/local/bin:/usr/bin:/bin".to_string()];
    environment.extend(
        submission
            .payload
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}")),
    );

    let resources = &submission.resources;
    let mut job = Map::new();
    job.insert("name".to_string(), json!(submission.external_name()));
    job.insert(
        "current_working_directory".to_string(),
        json!(submission
            .payload
            .working_dir
            .as_deref()
            .unwrap_or(default_working_dir)),
    );
    job.insert("environment".to_string(), json!(environment));
    job.insert(
        "cpus_per_task".to_string(),
        json!((resources.cpu.ceil() as u32).max(1)),
    );
    if resources.memory > 0.0 {
        job.insert(
            "memory_per_node".to_string(),
            json!({"set": true, "infinite": false, "number": resources.memory.ceil() as u64}),
        );
    }
    if resources.gpu > 0 {
        job.insert(
            "tres_per_job".to_string(),
            json!(format!("gres/gpu:{}", resources.gpu)),
        );
    }
    if let Some(partition) = partition {
        job.insert("partition".to_string(), json!(partition));
    }
    job.insert(
        "comment".to_string(),
        json!(format!("vdc job {}", submission.job_id)),
    );

    Ok(json!({ "script": script, "job": Value::Object(job) }))
}

/// Map a Slurm job record to an [`ExecutorStatus`].
#[must_use]
pub fn status_from_slurm(job: &SlurmJob) -> ExecutorStatus {
    let flags = job.job_state.flags();
    if let Some(failed) = flags.iter().find(|f| FAILED_STATES.contains(&f.as_str())) {
        let reason = match job.state_reason.as_deref() {
            Some(reason) if !reason.is_empty() && reason != "None" => format!("{failed}: {reason}"),
            _ => failed.clone(),
        };
        return ExecutorStatus::Failed(reason);
    }
    if flags.iter().any(|f| RUNNING_STATES.contains(&f.as_str())) {
        return ExecutorStatus::Running;
    }
    if flags.iter().any(|f| f == "COMPLETED") {
        return ExecutorStatus::Succeeded;
    }
    ExecutorStatus::Running
}

impl Executor for SlurmExecutor {
    fn executor_type(&self) -> ExecutorType {
        ExecutorType::Slurm
    }

    fn submit<'a>(
        &'a self,
        submission: &'a JobSubmission,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorHandle>> + Send + 'a>> {
        Box::pin(async move {
            let body = submission_body(submission, self.partition.as_deref(), &self.working_dir)?;
            let slurm_id = self
                .client
                .submit_job(&body)
                .await
                .map_err(|e| ExecutorError::SubmitFailed {
                    job_id: submission.job_id.to_string(),
                    reason: e.to_string(),
                })?;

            info!(job_id = %submission.job_id, slurm_job = slurm_id, "submitted slurm job");
            let handle = ExecutorHandle::new(ExecutorType::Slurm, slurm_id.to_string());
            Ok(match &self.partition {
                Some(partition) => handle.with_location(partition),
                None => handle,
            })
        })
    }

    fn get_status<'a>(
        &'a self,
        handle: &'a ExecutorHandle,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorStatus>> + Send + 'a>> {
        Box::pin(async move {
            match self.client.get_job(&handle.external_id).await {
                Ok(job) => Ok(status_from_slurm(&job)),
                Err(e) if e.is_not_found() => {
                    warn!(handle = %handle, "slurm job no longer known to the controller");
                    Ok(ExecutorStatus::Failed("job no longer known to slurmctld".to_string()))
                }
                Err(e) => Err(ExecutorError::StatusFailed {
                    handle: handle.to_string(),
                    reason: e.to_string(),
                }),
            }
        })
    }

    fn cancel<'a>(
        &'a self,
        handle: &'a ExecutorHandle,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            match self.client.cancel_job(&handle.external_id).await {
                Ok(()) => {
                    info!(handle = %handle, "cancelled slurm job");
                    Ok(())
                }
                Err(e) if e.is_not_found() => {
                    debug!(handle = %handle, "slurm job already gone");
                    Ok(())
                }
                Err(e) => Err(ExecutorError::CancelFailed {
                    handle: handle.to_string(),
                    reason: e.to_string(),
                }),
            }
        })
    }

    fn abandon<'a>(
        &'a self,
        submission: &'a JobSubmission,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            // Slurm numbers jobs itself; find the attempt by its name.
            let name = submission.external_name();
            let jobs = self
                .client
                .find_jobs_by_name(&name)
                .await
                .map_err(|e| ExecutorError::CancelFailed {
                    handle: name.clone(),
                    reason: e.to_string(),
                })?;
            for job in jobs
                .iter()
                .filter(|job| status_from_slurm(job) == ExecutorStatus::Running)
            {
                let handle = ExecutorHandle::new(ExecutorType::Slurm, job.job_id.to_string());
                self.cancel(&handle).await?;
            }
            Ok(())
        })
    }
}
