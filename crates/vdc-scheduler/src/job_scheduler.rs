//! Per-cluster queue, admission loop and job table.
//!
//! Admission follows a two-phase protocol per job: reserve quota under the
//! table lock, dispatch to the executor outside it, then commit the
//! reservation on success or release it on failure. Every path that takes a
//! job out of `Scheduled`/`Running` takes its reservation with it, so a
//! reservation is released at most once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};
use vdc_executor::{ExecutorError, ExecutorExt, ExecutorRegistry, JobSubmission};
use vdc_proto::{
    ClusterId, ExecutorHandle, ExecutorStatus, ExecutorType, Job, JobId, JobState, JobStatus,
    ResourceVector,
};
use vdc_quota::{QuotaProvider, Reservation};

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::policy::SchedulingPolicy;

#[derive(Debug)]
struct JobEntry {
    job: Job,
    reservation: Option<Reservation>,
}

/// Counters from one admission pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Jobs that obtained a reservation.
    pub admitted: usize,
    /// Queued jobs that did not fit.
    pub deferred: usize,
    /// Admitted jobs now running.
    pub dispatched: usize,
    /// Admitted jobs whose dispatch failed and were compensated.
    pub dispatch_failed: usize,
    /// Admitted jobs cancelled while their dispatch was in flight.
    pub cancelled_in_flight: usize,
}

/// Counters from one status poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    /// Running jobs queried.
    pub polled: usize,
    /// Jobs that finished successfully.
    pub succeeded: usize,
    /// Jobs that failed.
    pub failed: usize,
    /// Queries that errored or timed out; retried next tick.
    pub unknown: usize,
}

enum DispatchOutcome {
    Dispatched,
    Requeued,
    Failed,
    CancelledInFlight(Option<ExecutorHandle>),
}

/// Queue and admission engine for one cluster scope.
pub struct JobScheduler {
    cluster: ClusterId,
    executor_type: ExecutorType,
    provider: Arc<dyn QuotaProvider>,
    executors: Arc<ExecutorRegistry>,
    policy: Arc<dyn SchedulingPolicy>,
    config: SchedulerConfig,
    jobs: RwLock<HashMap<JobId, JobEntry>>,
    next_sequence: AtomicU64,
    pass_lock: Mutex<()>,
    wake: Notify,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("cluster", &self.cluster)
            .field("executor_type", &self.executor_type)
            .field("policy", &self.policy.name())
            .field("jobs", &self.jobs.read().len())
            .finish_non_exhaustive()
    }
}

impl JobScheduler {
    /// Create a scheduler for `cluster`.
    #[must_use]
    pub fn new(
        cluster: ClusterId,
        executor_type: ExecutorType,
        provider: Arc<dyn QuotaProvider>,
        executors: Arc<ExecutorRegistry>,
        policy: Arc<dyn SchedulingPolicy>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            cluster,
            executor_type,
            provider,
            executors,
            policy,
            config,
            jobs: RwLock::new(HashMap::new()),
            next_sequence: AtomicU64::new(0),
            pass_lock: Mutex::new(()),
            wake: Notify::new(),
        }
    }

    /// Cluster this scheduler admits for.
    #[must_use]
    pub const fn cluster(&self) -> &ClusterId {
        &self.cluster
    }

    /// Executor type of the cluster.
    #[must_use]
    pub const fn executor_type(&self) -> ExecutorType {
        self.executor_type
    }

    /// Quota provider of the cluster.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn QuotaProvider> {
        &self.provider
    }

    /// Add a queued job and wake the admission loop.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::DuplicateJob`] if the id is already tracked,
    /// or `InvalidTransition` if the job is not `Queued`.
    pub fn enqueue(&self, mut job: Job) -> Result<JobStatus> {
        if job.state != JobState::Queued {
            return Err(vdc_proto::ProtoError::InvalidTransition {
                job_id: job.id.to_string(),
                from: job.state,
                to: JobState::Queued,
            }
            .into());
        }

        let status = {
            let mut jobs = self.jobs.write();
            if jobs.contains_key(&job.id) {
                return Err(SchedulerError::DuplicateJob(job.id));
            }
            job.sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            job.cluster = Some(self.cluster.clone());
            info!(
                job_id = %job.id,
                cluster = %self.cluster,
                resources = %job.resources,
                priority = job.priority,
                "job queued"
            );
            let status = job.status();
            jobs.insert(
                job.id.clone(),
                JobEntry {
                    job,
                    reservation: None,
                },
            );
            status
        };
        self.wake.notify_one();
        Ok(status)
    }

    // ==================== Admission ====================

    /// Run one admission pass: reserve for every queued job that fits, in
    /// policy order, then dispatch the admitted jobs concurrently.
    ///
    /// Passes on the same scheduler are serialised.
    pub async fn run_admission_pass(&self) -> PassReport {
        let _pass = self.pass_lock.lock().await;
        let mut report = PassReport::default();

        if let Err(e) = self.provider.get_quota(&self.cluster).await {
            warn!(cluster = %self.cluster, error = %e, "quota refresh before admission failed");
        }

        let pending: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|e| e.job.state == JobState::Queued)
            .map(|e| e.job.clone())
            .collect();
        if pending.is_empty() {
            return report;
        }
        let ordered = self.policy.order(&pending);

        let mut admitted: Vec<(ExecutorType, JobSubmission)> = Vec::new();
        {
            let mut jobs = self.jobs.write();
            for candidate in ordered {
                let Some(entry) = jobs.get_mut(&candidate.id) else {
                    continue;
                };
                if entry.job.state != JobState::Queued {
                    continue;
                }
                match self.provider.reserve(&self.cluster, &entry.job.resources) {
                    Ok(reservation) => {
                        if let Err(e) = entry.job.transition_to(JobState::Scheduled, None) {
                            warn!(job_id = %entry.job.id, error = %e, "cannot schedule job");
                            self.release(&reservation);
                            continue;
                        }
                        debug!(
                            job_id = %entry.job.id,
                            cluster = %self.cluster,
                            reservation = %reservation.id,
                            "reserved quota"
                        );
                        entry.reservation = Some(reservation);
                        admitted.push((
                            entry.job.executor_type,
                            JobSubmission::for_job(&entry.job, self.cluster.clone()),
                        ));
                    }
                    Err(e) => {
                        debug!(job_id = %entry.job.id, reason = %e, "job deferred");
                        report.deferred += 1;
                    }
                }
            }
        }
        report.admitted = admitted.len();
        if admitted.is_empty() {
            return report;
        }

        info!(
            cluster = %self.cluster,
            policy = self.policy.name(),
            admitted = report.admitted,
            deferred = report.deferred,
            "admission pass"
        );

        let outcomes = join_all(
            admitted
                .iter()
                .map(|(executor_type, submission)| self.dispatch(*executor_type, submission)),
        )
        .await;

        for outcome in outcomes {
            match outcome {
                DispatchOutcome::Dispatched => report.dispatched += 1,
                DispatchOutcome::Requeued | DispatchOutcome::Failed => report.dispatch_failed += 1,
                DispatchOutcome::CancelledInFlight(_) => report.cancelled_in_flight += 1,
            }
        }
        report
    }

    async fn dispatch(
        &self,
        executor_type: ExecutorType,
        submission: &JobSubmission,
    ) -> DispatchOutcome {
        let result = match self.executors.get_executor(executor_type) {
            Ok(executor) => {
                let result = executor
                    .submit_within(submission, self.config.dispatch_timeout)
                    .await;
                if matches!(result, Err(ExecutorError::Timeout { .. })) {
                    // The backend may still create the attempt; retries use a new name.
                    if let Err(e) = executor
                        .abandon_within(submission, self.config.dispatch_timeout)
                        .await
                    {
                        warn!(
                            job_id = %submission.job_id,
                            attempt = submission.attempt,
                            error = %e,
                            "failed to clean up timed-out submit"
                        );
                    }
                }
                result
            }
            Err(e) => Err(e),
        };

        let outcome = self.complete_dispatch(&submission.job_id, result);
        if let DispatchOutcome::CancelledInFlight(Some(handle)) = &outcome {
            self.cancel_at_executor(&submission.job_id, executor_type, handle)
                .await;
        }
        outcome
    }

    fn complete_dispatch(
        &self,
        job_id: &JobId,
        result: std::result::Result<ExecutorHandle, ExecutorError>,
    ) -> DispatchOutcome {
        let mut jobs = self.jobs.write();
        let Some(entry) = jobs.get_mut(job_id) else {
            // Cancelled and drained while the dispatch was in flight.
            return DispatchOutcome::CancelledInFlight(result.ok());
        };

        if entry.job.state != JobState::Scheduled {
            debug!(job_id = %job_id, state = %entry.job.state, "dispatch finished after cancel");
            let handle = result.ok();
            if handle.is_some() {
                entry.job.handle.clone_from(&handle);
            }
            return DispatchOutcome::CancelledInFlight(handle);
        }

        match result {
            Ok(handle) => {
                if let Some(reservation) = entry.reservation.as_mut() {
                    if let Err(e) = self.provider.commit(reservation) {
                        warn!(job_id = %job_id, error = %e, "failed to commit reservation");
                    }
                }
                info!(job_id = %job_id, cluster = %self.cluster, handle = %handle, "job dispatched");
                entry.job.handle = Some(handle);
                entry.job.error = None;
                if let Err(e) = entry.job.transition_to(JobState::Running, None) {
                    warn!(job_id = %job_id, error = %e, "unexpected lifecycle state");
                }
                DispatchOutcome::Dispatched
            }
            Err(e) => {
                if let Some(reservation) = entry.reservation.take() {
                    self.release(&reservation);
                }
                entry.job.retries += 1;
                let reason = e.to_string();
                entry.job.error = Some(reason.clone());

                if entry.job.retries > self.config.max_dispatch_retries {
                    warn!(
                        job_id = %job_id,
                        cluster = %self.cluster,
                        retries = entry.job.retries,
                        error = %reason,
                        "dispatch retries exhausted; job failed"
                    );
                    if let Err(e) = entry.job.transition_to(JobState::Failed, Some(reason)) {
                        warn!(job_id = %job_id, error = %e, "unexpected lifecycle state");
                    }
                    drop(jobs);
                    self.wake.notify_one();
                    DispatchOutcome::Failed
                } else {
                    warn!(
                        job_id = %job_id,
                        cluster = %self.cluster,
                        retries = entry.job.retries,
                        error = %reason,
                        "dispatch failed; reservation released, job requeued"
                    );
                    if let Err(e) = entry.job.transition_to(JobState::Queued, Some(reason)) {
                        warn!(job_id = %job_id, error = %e, "unexpected lifecycle state");
                    }
                    DispatchOutcome::Requeued
                }
            }
        }
    }

    fn release(&self, reservation: &Reservation) {
        match self.provider.release(reservation) {
            Ok(true) => {}
            Ok(false) => {
                warn!(reservation = %reservation.id, "reservation was already released");
            }
            Err(e) => {
                warn!(reservation = %reservation.id, error = %e, "failed to release reservation");
            }
        }
    }

    async fn cancel_at_executor(
        &self,
        job_id: &JobId,
        executor_type: ExecutorType,
        handle: &ExecutorHandle,
    ) {
        let result = match self.executors.get_executor(executor_type) {
            Ok(executor) => executor.cancel_within(handle, self.config.dispatch_timeout).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => info!(job_id = %job_id, handle = %handle, "cancelled at executor"),
            Err(e) => {
                warn!(job_id = %job_id, handle = %handle, error = %e, "executor cancel failed");
            }
        }
    }

    // ==================== Cancellation ====================

    /// Cancel a job.
    ///
    /// A queued job is simply dropped from the queue. A job whose dispatch is
    /// in flight is cancelled immediately and its handle, once returned, is
    /// cancelled at the executor. A running job is cancelled at the
    /// executor; a backend error there is logged and the job stays
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::JobNotFound`] or
    /// [`SchedulerError::CannotCancel`] for terminal jobs.
    pub async fn cancel(&self, job_id: &JobId) -> Result<JobStatus> {
        let (status, executor_type, handle, released) = {
            let mut jobs = self.jobs.write();
            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| SchedulerError::JobNotFound(job_id.clone()))?;
            let from = entry.job.state;
            if from.is_terminal() {
                return Err(SchedulerError::CannotCancel {
                    job_id: job_id.clone(),
                    state: from,
                });
            }

            entry
                .job
                .transition_to(JobState::Cancelled, Some("cancelled by request".to_string()))?;
            let released = match entry.reservation.take() {
                Some(reservation) => {
                    self.release(&reservation);
                    true
                }
                None => false,
            };
            let handle = if from == JobState::Running {
                entry.job.handle.clone()
            } else {
                None
            };
            info!(job_id = %job_id, cluster = %self.cluster, from = %from, "job cancelled");
            (entry.job.status(), entry.job.executor_type, handle, released)
        };

        if released {
            self.wake.notify_one();
        }
        if let Some(handle) = handle {
            self.cancel_at_executor(job_id, executor_type, &handle).await;
        }
        Ok(status)
    }

    // ==================== Status ====================

    /// Query the executor for every running job.
    pub async fn poll_running(&self) -> PollReport {
        let running: Vec<(JobId, ExecutorType, ExecutorHandle)> = self
            .jobs
            .read()
            .values()
            .filter(|e| e.job.state == JobState::Running)
            .filter_map(|e| {
                e.job
                    .handle
                    .clone()
                    .map(|h| (e.job.id.clone(), e.job.executor_type, h))
            })
            .collect();

        let mut report = PollReport {
            polled: running.len(),
            ..PollReport::default()
        };
        if running.is_empty() {
            return report;
        }

        let results = join_all(running.iter().map(|(id, executor_type, handle)| async move {
            let status = match self.executors.get_executor(*executor_type) {
                Ok(executor) => executor.status_within(handle, self.config.poll_timeout).await,
                Err(e) => Err(e),
            };
            (id, handle, status)
        }))
        .await;

        for (id, handle, status) in results {
            match status {
                Ok(status) => match self.apply_status(id, status) {
                    Ok(Some(JobState::Succeeded)) => report.succeeded += 1,
                    Ok(Some(JobState::Failed)) => report.failed += 1,
                    Ok(_) => {}
                    Err(e) => debug!(job_id = %id, error = %e, "status for untracked job"),
                },
                Err(e) => {
                    debug!(job_id = %id, handle = %handle, error = %e, "status unknown; retrying next tick");
                    report.unknown += 1;
                }
            }
        }
        report
    }

    /// Apply an executor status pushed by the backend.
    ///
    /// Updates for jobs that are not running are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::JobNotFound`] if the job is not tracked.
    pub fn report_status(&self, job_id: &JobId, status: ExecutorStatus) -> Result<JobStatus> {
        self.apply_status(job_id, status)?;
        self.status(job_id)
    }

    /// Returns the new state if the status finished the job.
    fn apply_status(&self, job_id: &JobId, status: ExecutorStatus) -> Result<Option<JobState>> {
        let finished = {
            let mut jobs = self.jobs.write();
            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| SchedulerError::JobNotFound(job_id.clone()))?;
            if entry.job.state != JobState::Running {
                debug!(job_id = %job_id, state = %entry.job.state, "ignoring status for non-running job");
                return Ok(None);
            }

            let (to, reason) = match status {
                ExecutorStatus::Running => return Ok(None),
                ExecutorStatus::Succeeded => (JobState::Succeeded, None),
                ExecutorStatus::Failed(reason) => (JobState::Failed, Some(reason)),
            };
            if let Some(reservation) = entry.reservation.take() {
                self.release(&reservation);
            }
            if let Some(reason) = &reason {
                entry.job.error = Some(reason.clone());
            }
            entry.job.transition_to(to, reason)?;
            info!(job_id = %job_id, cluster = %self.cluster, state = %to, "job finished");
            to
        };
        self.wake.notify_one();
        Ok(Some(finished))
    }

    // ==================== Views ====================

    /// Status of one job.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::JobNotFound`] if the job is not tracked.
    pub fn status(&self, job_id: &JobId) -> Result<JobStatus> {
        self.jobs
            .read()
            .get(job_id)
            .map(|e| e.job.status())
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.clone()))
    }

    /// Check if a job is tracked here.
    #[must_use]
    pub fn contains(&self, job_id: &JobId) -> bool {
        self.jobs.read().contains_key(job_id)
    }

    /// Number of queued jobs.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.jobs
            .read()
            .values()
            .filter(|e| e.job.state == JobState::Queued)
            .count()
    }

    /// Total resources requested by queued jobs.
    #[must_use]
    pub fn pending_demand(&self) -> ResourceVector {
        self.jobs
            .read()
            .values()
            .filter(|e| e.job.state == JobState::Queued)
            .map(|e| e.job.resources)
            .sum()
    }

    /// Every tracked job, in insertion order.
    #[must_use]
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().values().map(|e| e.job.clone()).collect();
        jobs.sort_by_key(|j| j.sequence);
        jobs
    }

    /// Remove and return every terminal job, in insertion order.
    pub fn drain_finished(&self) -> Vec<Job> {
        let mut drained: Vec<Job> = {
            let mut jobs = self.jobs.write();
            let finished: Vec<JobId> = jobs
                .iter()
                .filter(|(_, e)| e.job.is_terminal())
                .map(|(id, _)| id.clone())
                .collect();
            finished
                .iter()
                .filter_map(|id| jobs.remove(id))
                .map(|e| e.job)
                .collect()
        };
        drained.sort_by_key(|j| j.sequence);
        if !drained.is_empty() {
            debug!(cluster = %self.cluster, count = drained.len(), "drained finished jobs");
        }
        drained
    }

    // ==================== Loop ====================

    /// Admit on wake-ups and on `admission_interval`, poll on
    /// `poll_interval`, until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut admission = tokio::time::interval(self.config.admission_interval);
        admission.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            cluster = %self.cluster,
            policy = self.policy.name(),
            "starting admission loop"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = admission.tick() => {
                    self.run_admission_pass().await;
                }
                () = self.wake.notified() => {
                    self.run_admission_pass().await;
                }
                _ = poll.tick() => {
                    self.poll_running().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(cluster = %self.cluster, "admission loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{FifoPolicy, PriorityPolicy};
    use chrono::Utc;
    use std::time::Duration;
    use vdc_executor::MockExecutor;
    use vdc_proto::JobRequest;
    use vdc_quota::LocalQuotaProvider;

    struct Fixture {
        scheduler: Arc<JobScheduler>,
        provider: Arc<LocalQuotaProvider>,
        mock: Arc<MockExecutor>,
    }

    fn cluster() -> ClusterId {
        ClusterId::new("east").unwrap_or_else(|_| unreachable!())
    }

    fn rv(cpu: f64, gpu: u32) -> ResourceVector {
        ResourceVector::ZERO.with_cpu(cpu).with_gpu(gpu)
    }

    fn fixture_with(limits: ResourceVector, config: SchedulerConfig, policy: Arc<dyn SchedulingPolicy>) -> Fixture {
        let provider = Arc::new(
            LocalQuotaProvider::new()
                .with_scope(cluster(), limits)
                .unwrap_or_else(|_| unreachable!()),
        );
        let mock = Arc::new(MockExecutor::new(ExecutorType::Local));
        let registry = Arc::new(ExecutorRegistry::new());
        registry.register(mock.clone());
        let scheduler = Arc::new(JobScheduler::new(
            cluster(),
            ExecutorType::Local,
            provider.clone(),
            registry,
            policy,
            config,
        ));
        Fixture {
            scheduler,
            provider,
            mock,
        }
    }

    fn fixture(limits: ResourceVector) -> Fixture {
        fixture_with(limits, SchedulerConfig::default(), Arc::new(FifoPolicy))
    }

    fn job_id(id: &str) -> JobId {
        JobId::new(id).unwrap_or_else(|_| unreachable!())
    }

    fn job(id: &str, resources: ResourceVector, priority: i32) -> Job {
        let request = JobRequest::new(job_id(id), resources, ExecutorType::Local).with_priority(priority);
        Job::from_request(request, Utc::now())
    }

    fn used(f: &Fixture) -> ResourceVector {
        f.provider.snapshot(&cluster()).map_or(ResourceVector::ZERO, |s| s.used)
    }

    fn state(f: &Fixture, id: &str) -> Option<JobState> {
        f.scheduler.status(&job_id(id)).ok().map(|s| s.state)
    }

    // ==================== Enqueue ====================

    #[test]
    fn test_enqueue_assigns_sequence_and_cluster() {
        let f = fixture(rv(8.0, 0));
        let a = f.scheduler.enqueue(job("a", rv(1.0, 0), 0));
        assert_eq!(a.ok().and_then(|s| s.cluster), Some(cluster()));
        let _ = f.scheduler.enqueue(job("b", rv(1.0, 0), 0));
        let seqs: Vec<u64> = f.scheduler.jobs().iter().map(|j| j.sequence).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(f.scheduler.queue_length(), 2);
        assert!((f.scheduler.pending_demand().cpu - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_enqueue_duplicate_rejected() {
        let f = fixture(rv(8.0, 0));
        assert!(f.scheduler.enqueue(job("a", rv(1.0, 0), 0)).is_ok());
        assert!(matches!(
            f.scheduler.enqueue(job("a", rv(1.0, 0), 0)),
            Err(SchedulerError::DuplicateJob(_))
        ));
    }

    // ==================== Admission ====================

    #[tokio::test]
    async fn test_admission_scenario() {
        let f = fixture(rv(8.0, 2));
        for id in ["j1", "j2"] {
            let _ = f.scheduler.enqueue(job(id, rv(4.0, 1), 0));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let _ = f.scheduler.enqueue(job("j3", rv(2.0, 1), 0));

        let report = f.scheduler.run_admission_pass().await;
        assert_eq!(report.admitted, 2);
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.deferred, 1);
        assert_eq!(used(&f), rv(8.0, 2));
        assert_eq!(state(&f, "j1"), Some(JobState::Running));
        assert_eq!(state(&f, "j2"), Some(JobState::Running));
        assert_eq!(state(&f, "j3"), Some(JobState::Queued));

        assert!(f.mock.complete(&job_id("j1")));
        let poll = f.scheduler.poll_running().await;
        assert_eq!(poll.succeeded, 1);
        assert_eq!(used(&f), rv(4.0, 1));

        let report = f.scheduler.run_admission_pass().await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(state(&f, "j3"), Some(JobState::Running));
        assert_eq!(used(&f), rv(6.0, 2));
    }

    #[tokio::test]
    async fn test_no_head_of_line_blocking() {
        let f = fixture_with(rv(4.0, 0), SchedulerConfig::default(), Arc::new(PriorityPolicy));
        let _ = f.scheduler.enqueue(job("big", rv(8.0, 0), 10));
        let _ = f.scheduler.enqueue(job("small", rv(1.0, 0), 0));
        let report = f.scheduler.run_admission_pass().await;
        assert_eq!(report.admitted, 1);
        assert_eq!(state(&f, "big"), Some(JobState::Queued));
        assert_eq!(state(&f, "small"), Some(JobState::Running));
    }

    #[tokio::test]
    async fn test_dispatch_failure_compensates_exactly() {
        let f = fixture(rv(8.0, 0));
        let _ = f.provider.reserve(&cluster(), &rv(1.0, 0));
        let before = used(&f);

        f.mock.fail_next_submits(1);
        let _ = f.scheduler.enqueue(job("a", rv(3.0, 0), 0));
        let report = f.scheduler.run_admission_pass().await;

        assert_eq!(report.dispatch_failed, 1);
        assert_eq!(used(&f), before);
        let status = f.scheduler.status(&job_id("a")).unwrap_or_else(|_| unreachable!());
        assert_eq!(status.state, JobState::Queued);
        assert_eq!(status.retries, 1);
        assert!(status.error.is_some());

        let report = f.scheduler.run_admission_pass().await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(state(&f, "a"), Some(JobState::Running));
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_job() {
        let config = SchedulerConfig::default().with_max_dispatch_retries(1);
        let f = fixture_with(rv(8.0, 0), config, Arc::new(FifoPolicy));
        f.mock.set_fail_all_submits(true);
        let _ = f.scheduler.enqueue(job("a", rv(1.0, 0), 0));

        let _ = f.scheduler.run_admission_pass().await;
        assert_eq!(state(&f, "a"), Some(JobState::Queued));
        let _ = f.scheduler.run_admission_pass().await;
        assert_eq!(state(&f, "a"), Some(JobState::Failed));
        assert_eq!(used(&f), ResourceVector::ZERO);
        assert_eq!(f.provider.reservation_count(&cluster()), 0);
    }

    #[tokio::test]
    async fn test_dispatch_timeout_is_a_failure() {
        let config = SchedulerConfig::default()
            .with_timeouts(Duration::from_millis(20), Duration::from_secs(1));
        let f = fixture_with(rv(8.0, 0), config, Arc::new(FifoPolicy));
        f.mock.set_submit_delay(Duration::from_millis(200));
        let _ = f.scheduler.enqueue(job("slow", rv(1.0, 0), 0));

        let report = f.scheduler.run_admission_pass().await;
        assert_eq!(report.dispatch_failed, 1);
        assert_eq!(used(&f), ResourceVector::ZERO);
    }

    #[tokio::test]
    async fn test_timed_out_attempts_are_abandoned() {
        let config = SchedulerConfig::default()
            .with_timeouts(Duration::from_millis(20), Duration::from_secs(1));
        let f = fixture_with(rv(8.0, 0), config, Arc::new(FifoPolicy));
        f.mock.set_submit_delay(Duration::from_millis(200));
        let _ = f.scheduler.enqueue(job("slow", rv(1.0, 0), 0));

        let _ = f.scheduler.run_admission_pass().await;
        let _ = f.scheduler.run_admission_pass().await;

        let cancelled: Vec<String> = f.mock.cancelled().into_iter().map(|h| h.external_id).collect();
        assert_eq!(cancelled, vec!["vdc-slow-0".to_string(), "vdc-slow-1".to_string()]);
        assert_eq!(used(&f), ResourceVector::ZERO);
        assert_eq!(f.provider.reservation_count(&cluster()), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_executor_compensates() {
        let f = fixture(rv(8.0, 0));
        let request = JobRequest::new(job_id("k"), rv(1.0, 0), ExecutorType::Kubernetes);
        let _ = f.scheduler.enqueue(Job::from_request(request, Utc::now()));
        let report = f.scheduler.run_admission_pass().await;
        assert_eq!(report.dispatch_failed, 1);
        assert_eq!(used(&f), ResourceVector::ZERO);
    }

    // ==================== Cancellation ====================

    #[tokio::test]
    async fn test_cancel_queued() {
        let f = fixture(rv(8.0, 0));
        let _ = f.scheduler.enqueue(job("a", rv(1.0, 0), 0));
        let status = f.scheduler.cancel(&job_id("a")).await;
        assert_eq!(status.ok().map(|s| s.state), Some(JobState::Cancelled));
        assert_eq!(f.scheduler.run_admission_pass().await.admitted, 0);
        assert_eq!(f.mock.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_running_releases_and_cancels_at_executor() {
        let f = fixture(rv(8.0, 0));
        let _ = f.scheduler.enqueue(job("a", rv(2.0, 0), 0));
        let _ = f.scheduler.run_admission_pass().await;
        assert_eq!(used(&f), rv(2.0, 0));

        let status = f.scheduler.cancel(&job_id("a")).await;
        assert_eq!(status.ok().map(|s| s.state), Some(JobState::Cancelled));
        assert_eq!(used(&f), ResourceVector::ZERO);
        assert_eq!(f.mock.cancelled().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_running_survives_executor_error() {
        let f = fixture(rv(8.0, 0));
        f.mock.set_cancel_errors(true);
        let _ = f.scheduler.enqueue(job("a", rv(2.0, 0), 0));
        let _ = f.scheduler.run_admission_pass().await;
        let status = f.scheduler.cancel(&job_id("a")).await;
        assert_eq!(status.ok().map(|s| s.state), Some(JobState::Cancelled));
        assert_eq!(used(&f), ResourceVector::ZERO);
    }

    #[tokio::test]
    async fn test_cancel_terminal_rejected() {
        let f = fixture(rv(8.0, 0));
        let _ = f.scheduler.enqueue(job("a", rv(1.0, 0), 0));
        let _ = f.scheduler.cancel(&job_id("a")).await;
        assert!(matches!(
            f.scheduler.cancel(&job_id("a")).await,
            Err(SchedulerError::CannotCancel { .. })
        ));
        assert!(matches!(
            f.scheduler.cancel(&job_id("ghost")).await,
            Err(SchedulerError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_dispatch_releases_once() {
        let f = fixture(rv(8.0, 0));
        f.mock.set_submit_delay(Duration::from_millis(100));
        let _ = f.scheduler.enqueue(job("a", rv(4.0, 0), 0));

        let pass = tokio::spawn({
            let scheduler = Arc::clone(&f.scheduler);
            async move { scheduler.run_admission_pass().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(state(&f, "a"), Some(JobState::Scheduled));
        assert_eq!(used(&f), rv(4.0, 0));

        let _ = f.scheduler.cancel(&job_id("a")).await;
        assert_eq!(used(&f), ResourceVector::ZERO);

        let report = pass.await.unwrap_or_default();
        assert_eq!(report.cancelled_in_flight, 1);
        assert_eq!(state(&f, "a"), Some(JobState::Cancelled));
        assert_eq!(used(&f), ResourceVector::ZERO);
        assert_eq!(f.provider.reservation_count(&cluster()), 0);
        assert_eq!(f.mock.cancelled().len(), 1);
    }

    // ==================== Status ====================

    #[tokio::test]
    async fn test_report_status_failed() {
        let f = fixture(rv(8.0, 0));
        let _ = f.scheduler.enqueue(job("a", rv(1.0, 0), 0));
        let _ = f.scheduler.run_admission_pass().await;

        let status = f
            .scheduler
            .report_status(&job_id("a"), ExecutorStatus::Failed("OOMKilled".to_string()))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error.as_deref(), Some("OOMKilled"));
        assert_eq!(used(&f), ResourceVector::ZERO);

        // Late updates for finished jobs change nothing.
        let again = f.scheduler.report_status(&job_id("a"), ExecutorStatus::Succeeded);
        assert_eq!(again.ok().map(|s| s.state), Some(JobState::Failed));
    }

    #[tokio::test]
    async fn test_poll_errors_are_unknown() {
        let f = fixture(rv(8.0, 0));
        let _ = f.scheduler.enqueue(job("a", rv(1.0, 0), 0));
        let _ = f.scheduler.run_admission_pass().await;
        f.mock.set_status_errors(true);

        let report = f.scheduler.poll_running().await;
        assert_eq!(report.polled, 1);
        assert_eq!(report.unknown, 1);
        assert_eq!(state(&f, "a"), Some(JobState::Running));
    }

    #[tokio::test]
    async fn test_history_and_drain() {
        let f = fixture(rv(8.0, 0));
        let _ = f.scheduler.enqueue(job("a", rv(1.0, 0), 0));
        let _ = f.scheduler.enqueue(job("b", rv(1.0, 0), 0));
        let _ = f.scheduler.run_admission_pass().await;
        let _ = f.scheduler.report_status(&job_id("a"), ExecutorStatus::Succeeded);

        let drained = f.scheduler.drain_finished();
        assert_eq!(drained.len(), 1);
        let states: Vec<JobState> = drained[0].history.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![JobState::Queued, JobState::Scheduled, JobState::Running, JobState::Succeeded]
        );
        assert!(!f.scheduler.contains(&job_id("a")));
        assert!(f.scheduler.contains(&job_id("b")));
        assert!(f.scheduler.drain_finished().is_empty());
    }

    // ==================== Loop ====================

    #[tokio::test]
    async fn test_run_admits_on_wake_and_stops() {
        let config = SchedulerConfig::default()
            .with_intervals(Duration::from_secs(3600), Duration::from_millis(10));
        let f = fixture_with(rv(8.0, 0), config, Arc::new(FifoPolicy));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&f.scheduler).run(rx));

        let _ = f.scheduler.enqueue(job("a", rv(1.0, 0), 0));
        for _ in 0..100 {
            if state(&f, "a") == Some(JobState::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(state(&f, "a"), Some(JobState::Running));

        f.mock.complete(&job_id("a"));
        for _ in 0..100 {
            if state(&f, "a") == Some(JobState::Succeeded) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(state(&f, "a"), Some(JobState::Succeeded));

        let _ = tx.send(true);
        assert!(tokio::time::timeout(Duration::from_secs(2), handle).await.is_ok());
    }
}
