//! Scriptable in-memory executor.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;
use vdc_proto::{ExecutorHandle, ExecutorStatus, ExecutorType, JobId};

use crate::error::{ExecutorError, Result};
use crate::executor::{Executor, JobSubmission};

/// Executor that records calls and answers from a script.
///
/// Used by tests and by `vdcd --dry-run`. Every accepted submission starts
/// `Running` until [`MockExecutor::complete`] or [`MockExecutor::fail`] is
/// called for it.
#[derive(Debug)]
pub struct MockExecutor {
    executor_type: ExecutorType,
    next_id: AtomicU64,
    failing_submits: AtomicU32,
    fail_all_submits: AtomicBool,
    failing_status: AtomicBool,
    failing_cancel: AtomicBool,
    submit_delay: Mutex<Duration>,
    handles: Mutex<HashMap<JobId, ExecutorHandle>>,
    statuses: Mutex<HashMap<String, ExecutorStatus>>,
    submitted: Mutex<Vec<JobSubmission>>,
    cancelled: Mutex<Vec<ExecutorHandle>>,
}

impl MockExecutor {
    /// Create a mock standing in for `executor_type`.
    #[must_use]
    pub fn new(executor_type: ExecutorType) -> Self {
        Self {
            executor_type,
            next_id: AtomicU64::new(1),
            failing_submits: AtomicU32::new(0),
            fail_all_submits: AtomicBool::new(false),
            failing_status: AtomicBool::new(false),
            failing_cancel: AtomicBool::new(false),
            submit_delay: Mutex::new(Duration::ZERO),
            handles: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    // ==================== Scripting ====================

    /// Fail the next `n` submissions.
    pub fn fail_next_submits(&self, n: u32) {
        self.failing_submits.store(n, Ordering::SeqCst);
    }

    /// Fail every submission until turned off.
    pub fn set_fail_all_submits(&self, fail: bool) {
        self.fail_all_submits.store(fail, Ordering::SeqCst);
    }

    /// Make status queries fail until turned off.
    pub fn set_status_errors(&self, fail: bool) {
        self.failing_status.store(fail, Ordering::SeqCst);
    }

    /// Make cancel calls fail until turned off.
    pub fn set_cancel_errors(&self, fail: bool) {
        self.failing_cancel.store(fail, Ordering::SeqCst);
    }

    /// Delay every submission.
    pub fn set_submit_delay(&self, delay: Duration) {
        *self.submit_delay.lock() = delay;
    }

    /// Report `job_id` as succeeded. Returns `false` if it was never submitted.
    pub fn complete(&self, job_id: &JobId) -> bool {
        self.set_status(job_id, ExecutorStatus::Succeeded)
    }

    /// Report `job_id` as failed. Returns `false` if it was never submitted.
    pub fn fail(&self, job_id: &JobId, reason: impl Into<String>) -> bool {
        self.set_status(job_id, ExecutorStatus::Failed(reason.into()))
    }

    /// Set the status reported for `job_id`'s latest handle.
    pub fn set_status(&self, job_id: &JobId, status: ExecutorStatus) -> bool {
        let Some(handle) = self.handle_for(job_id) else {
            return false;
        };
        self.statuses.lock().insert(handle.external_id, status);
        true
    }

    // ==================== Inspection ====================

    /// Latest handle issued for a job.
    #[must_use]
    pub fn handle_for(&self, job_id: &JobId) -> Option<ExecutorHandle> {
        self.handles.lock().get(job_id).cloned()
    }

    /// All submission attempts, accepted or not.
    #[must_use]
    pub fn submitted(&self) -> Vec<JobSubmission> {
        self.submitted.lock().clone()
    }

    /// Number of submission attempts.
    #[must_use]
    pub fn submit_count(&self) -> usize {
        self.submitted.lock().len()
    }

    /// Handles passed to `cancel`.
    #[must_use]
    pub fn cancelled(&self) -> Vec<ExecutorHandle> {
        self.cancelled.lock().clone()
    }

    fn take_submit_failure(&self) -> bool {
        if self.fail_all_submits.load(Ordering::SeqCst) {
            return true;
        }
        self.failing_submits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Executor for MockExecutor {
    fn executor_type(&self) -> ExecutorType {
        self.executor_type
    }

    fn submit<'a>(
        &'a self,
        submission: &'a JobSubmission,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorHandle>> + Send + 'a>> {
        Box::pin(async move {
            let delay = *self.submit_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.submitted.lock().push(submission.clone());

            if self.take_submit_failure() {
                debug!(job_id = %submission.job_id, "mock submit failure");
                return Err(ExecutorError::SubmitFailed {
                    job_id: submission.job_id.to_string(),
                    reason: "scripted failure".to_string(),
                });
            }

            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let handle = ExecutorHandle::new(self.executor_type, format!("mock-{n}"))
                .with_location(submission.cluster.as_str());
            self.statuses
                .lock()
                .insert(handle.external_id.clone(), ExecutorStatus::Running);
            self.handles
                .lock()
                .insert(submission.job_id.clone(), handle.clone());
            Ok(handle)
        })
    }

    fn get_status<'a>(
        &'a self,
        handle: &'a ExecutorHandle,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorStatus>> + Send + 'a>> {
        Box::pin(async move {
            if self.failing_status.load(Ordering::SeqCst) {
                return Err(ExecutorError::StatusFailed {
                    handle: handle.to_string(),
                    reason: "scripted failure".to_string(),
                });
            }
            self.statuses
                .lock()
                .get(&handle.external_id)
                .cloned()
                .ok_or_else(|| ExecutorError::StatusFailed {
                    handle: handle.to_string(),
                    reason: "unknown handle".to_string(),
                })
        })
    }

    fn cancel<'a>(
        &'a self,
        handle: &'a ExecutorHandle,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.cancelled.lock().push(handle.clone());
            if self.failing_cancel.load(Ordering::SeqCst) {
                return Err(ExecutorError::CancelFailed {
                    handle: handle.to_string(),
                    reason: "scripted failure".to_string(),
                });
            }
            self.statuses.lock().insert(
                handle.external_id.clone(),
                ExecutorStatus::Failed("cancelled".to_string()),
            );
            Ok(())
        })
    }
}
