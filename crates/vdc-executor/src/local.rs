//! Local executor: payload commands as child processes of the scheduler.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use vdc_proto::{ExecutorHandle, ExecutorStatus, ExecutorType};

use crate::error::{ExecutorError, Result};
use crate::executor::{Executor, JobSubmission};

#[derive(Debug)]
struct LocalProcess {
    child: Child,
    finished: Option<ExecutorStatus>,
}

impl LocalProcess {
    fn poll(&mut self) -> std::io::Result<ExecutorStatus> {
        if let Some(status) = &self.finished {
            return Ok(status.clone());
        }
        let status = match self.child.try_wait()? {
            None => ExecutorStatus::Running,
            Some(exit) if exit.success() => ExecutorStatus::Succeeded,
            Some(exit) => ExecutorStatus::Failed(format!("process exited with {exit}")),
        };
        if status.is_finished() {
            self.finished = Some(status.clone());
        }
        Ok(status)
    }
}

/// Executor running jobs as local child processes.
///
/// Output is discarded; the exit status decides success.
#[derive(Debug)]
pub struct LocalExecutor {
    working_dir: PathBuf,
    max_processes: usize,
    processes: Mutex<HashMap<String, LocalProcess>>,
}

impl LocalExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(working_dir: impl Into<PathBuf>, max_processes: usize) -> Self {
        Self {
            working_dir: working_dir.into(),
            max_processes,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Default working directory.
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Number of processes still running.
    #[must_use]
    pub fn running_count(&self) -> usize {
        running(&mut self.processes.lock())
    }

    /// Number of tracked processes, finished ones included until their
    /// terminal status has been reported.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.processes.lock().len()
    }

    fn spawn(&self, submission: &JobSubmission) -> Result<ExecutorHandle> {
        let submit_failed = |reason: String| ExecutorError::SubmitFailed {
            job_id: submission.job_id.to_string(),
            reason,
        };

        let Some((program, args)) = submission.payload.command.split_first() else {
            return Err(submit_failed("local jobs need a command".to_string()));
        };

        // Held across the capacity check and the insert.
        let mut processes = self.processes.lock();
        if running(&mut processes) >= self.max_processes {
            return Err(submit_failed(format!(
                "local pool is full ({} processes)",
                self.max_processes
            )));
        }

        let dir = submission
            .payload
            .working_dir
            .as_ref()
            .map_or_else(|| self.working_dir.clone(), PathBuf::from);

        let child = Command::new(program)
            .args(args)
            .envs(&submission.payload.env)
            .env("VDC_JOB_ID", submission.job_id.as_str())
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| submit_failed(format!("failed to spawn '{program}': {e}")))?;

        let name = submission.external_name();
        info!(
            job_id = %submission.job_id,
            name = %name,
            pid = child.id().unwrap_or_default(),
            "started local process"
        );
        processes.insert(
            name.clone(),
            LocalProcess {
                child,
                finished: None,
            },
        );
        Ok(ExecutorHandle::new(ExecutorType::Local, name).with_location(dir.display().to_string()))
    }
}

fn running(processes: &mut HashMap<String, LocalProcess>) -> usize {
    processes
        .values_mut()
        .filter_map(|p| p.poll().ok())
        .filter(|s| matches!(s, ExecutorStatus::Running))
        .count()
}

impl Executor for LocalExecutor {
    fn executor_type(&self) -> ExecutorType {
        ExecutorType::Local
    }

    fn submit<'a>(
        &'a self,
        submission: &'a JobSubmission,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorHandle>> + Send + 'a>> {
        Box::pin(async move { self.spawn(submission) })
    }

    fn get_status<'a>(
        &'a self,
        handle: &'a ExecutorHandle,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorStatus>> + Send + 'a>> {
        Box::pin(async move {
            let mut processes = self.processes.lock();
            let process = processes.get_mut(&handle.external_id).ok_or_else(|| {
                ExecutorError::StatusFailed {
                    handle: handle.to_string(),
                    reason: "unknown local process".to_string(),
                }
            })?;
            let status = process.poll().map_err(|e| ExecutorError::StatusFailed {
                handle: handle.to_string(),
                reason: e.to_string(),
            })?;
            if status.is_finished() {
                processes.remove(&handle.external_id);
                debug!(handle = %handle, status = ?status, "local process reaped");
            }
            Ok(status)
        })
    }

    fn cancel<'a>(
        &'a self,
        handle: &'a ExecutorHandle,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let Some(mut process) = self.processes.lock().remove(&handle.external_id) else {
                debug!(handle = %handle, "local process already gone");
                return Ok(());
            };
            if process.finished.is_some() {
                return Ok(());
            }
            if let Err(e) = process.child.start_kill() {
                warn!(handle = %handle, error = %e, "failed to kill local process");
                return Err(ExecutorError::CancelFailed {
                    handle: handle.to_string(),
                    reason: e.to_string(),
                });
            }
            // Reap so the process does not linger as a zombie.
            let _ = process.child.wait().await;
            info!(handle = %handle, "killed local process");
            Ok(())
        })
    }
}
