//! VDC front door: routes submissions to a cluster and aggregates views.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vdc_executor::{ExecutorError, ExecutorRegistry};
use vdc_proto::{
    ClusterId, ExecutorType, Job, JobId, JobRequest, JobStatus, QuotaSnapshot, ResourceUsage,
    ResourceVector,
};
use vdc_quota::QuotaProvider;

use crate::config::{QuotaManagerConfig, SchedulerConfig};
use crate::error::{Result, SchedulerError};
use crate::job_scheduler::{JobScheduler, PassReport, PollReport};
use crate::policy::SchedulingPolicy;
use crate::quota_manager::VdcQuotaManager;
use crate::selector::{ClusterCandidate, ClusterSelector};

/// Quota usage of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeUsage {
    /// Cluster scope.
    pub cluster: ClusterId,
    /// Executor type of the cluster.
    pub executor_type: ExecutorType,
    /// Latest cached snapshot, if any.
    pub snapshot: Option<QuotaSnapshot>,
    /// Utilisation percentages of the snapshot.
    pub usage: Option<ResourceUsage>,
    /// Jobs waiting for admission.
    pub queue_length: usize,
}

/// Multi-cluster scheduler.
pub struct VdcScheduler {
    config: SchedulerConfig,
    quota: Arc<VdcQuotaManager>,
    selector: ClusterSelector,
    executors: Arc<ExecutorRegistry>,
    policy: Arc<dyn SchedulingPolicy>,
    clusters: RwLock<BTreeMap<ClusterId, Arc<JobScheduler>>>,
    owners: RwLock<HashMap<JobId, ClusterId>>,
}

impl std::fmt::Debug for VdcScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VdcScheduler")
            .field("policy", &self.policy.name())
            .field("selector", &self.selector)
            .field("clusters", &self.clusters.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl VdcScheduler {
    /// Create a scheduler with no clusters.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] if either configuration is invalid.
    pub fn new(
        config: SchedulerConfig,
        quota_config: QuotaManagerConfig,
        executors: Arc<ExecutorRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        quota_config.validate()?;
        info!(
            policy = %config.policy,
            selection = %config.selection,
            executors = ?executors.configured_types(),
            "vdc scheduler created"
        );
        Ok(Self {
            policy: config.policy.build(),
            selector: ClusterSelector::from_kind(config.selection),
            quota: Arc::new(VdcQuotaManager::new(quota_config)),
            executors,
            config,
            clusters: RwLock::new(BTreeMap::new()),
            owners: RwLock::new(HashMap::new()),
        })
    }

    /// Register a cluster with its quota provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster is already registered or the provider
    /// does not manage it.
    pub fn add_cluster(
        &self,
        cluster: ClusterId,
        executor_type: ExecutorType,
        provider: Arc<dyn QuotaProvider>,
    ) -> Result<()> {
        self.quota
            .register_cluster(cluster.clone(), executor_type, Arc::clone(&provider))?;
        let scheduler = JobScheduler::new(
            cluster.clone(),
            executor_type,
            provider,
            Arc::clone(&self.executors),
            Arc::clone(&self.policy),
            self.config.clone(),
        );
        self.clusters.write().insert(cluster, Arc::new(scheduler));
        Ok(())
    }

    /// The quota manager.
    #[must_use]
    pub const fn quota_manager(&self) -> &Arc<VdcQuotaManager> {
        &self.quota
    }

    /// The executor registry.
    #[must_use]
    pub const fn executors(&self) -> &Arc<ExecutorRegistry> {
        &self.executors
    }

    /// Scheduler of one cluster.
    #[must_use]
    pub fn cluster(&self, cluster: &ClusterId) -> Option<Arc<JobScheduler>> {
        self.clusters.read().get(cluster).cloned()
    }

    fn schedulers(&self) -> Vec<Arc<JobScheduler>> {
        self.clusters.read().values().cloned().collect()
    }

    fn owner(&self, job_id: &JobId) -> Result<Arc<JobScheduler>> {
        let cluster = self
            .owners
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.clone()))?;
        self.cluster(&cluster)
            .ok_or(SchedulerError::UnknownCluster(cluster))
    }

    // ==================== Submission ====================

    /// Accept a job and queue it on a cluster.
    ///
    /// The job is queued even when no cluster has room right now; it then
    /// waits on the best-effort cluster.
    ///
    /// # Errors
    ///
    /// Returns `InvalidResourceRequest` for a malformed request,
    /// [`SchedulerError::DuplicateJob`], `ExecutorNotConfigured` when the
    /// executor type has no backend, or [`SchedulerError::NoEligibleCluster`]
    /// when no cluster runs that executor type.
    pub async fn submit(&self, request: JobRequest) -> Result<JobStatus> {
        request.validate()?;
        if self.owners.read().contains_key(&request.id) {
            return Err(SchedulerError::DuplicateJob(request.id));
        }
        if !self.executors.is_configured(request.executor_type) {
            return Err(ExecutorError::ExecutorNotConfigured(request.executor_type).into());
        }
        let eligible = self.quota.clusters_for(request.executor_type);
        if eligible.is_empty() {
            return Err(SchedulerError::NoEligibleCluster(request.executor_type));
        }

        self.quota
            .ensure_fresh(self.quota.config().refresh_interval)
            .await;
        let candidates: Vec<ClusterCandidate> = self
            .quota
            .candidates(request.executor_type)
            .into_iter()
            .map(|c| self.net_of_queue(c))
            .collect();

        let cluster = match self.place(&request, &candidates).await {
            Some(cluster) => cluster,
            None => self.best_effort(&request, &candidates, &eligible),
        };
        let Some(scheduler) = self.cluster(&cluster) else {
            return Err(SchedulerError::UnknownCluster(cluster));
        };

        let job = Job::from_request(request, Utc::now());
        let mut owners = self.owners.write();
        if owners.contains_key(&job.id) {
            return Err(SchedulerError::DuplicateJob(job.id));
        }
        let job_id = job.id.clone();
        let status = scheduler.enqueue(job)?;
        owners.insert(job_id, cluster);
        Ok(status)
    }

    /// Subtract the demand already queued on a cluster from its snapshot.
    fn net_of_queue(&self, mut candidate: ClusterCandidate) -> ClusterCandidate {
        if let Some(scheduler) = self.cluster(&candidate.cluster) {
            candidate.snapshot.used += scheduler.pending_demand();
        }
        candidate
    }

    /// Ranked placement with live confirmation and bounded fallback.
    async fn place(
        &self,
        request: &JobRequest,
        candidates: &[ClusterCandidate],
    ) -> Option<ClusterId> {
        let mut ranked = self.selector.rank(&request.resources, candidates);
        if let Some(hint) = &request.cluster_hint {
            if let Some(pos) = ranked.iter().position(|c| c == hint) {
                let hinted = ranked.remove(pos);
                ranked.insert(0, hinted);
            } else {
                debug!(job_id = %request.id, hint = %hint, "cluster hint is not a viable candidate");
            }
        }

        for (attempt, cluster) in ranked.into_iter().take(self.config.fallback_count + 1).enumerate() {
            if self.confirm(&cluster, &request.resources).await {
                if attempt > 0 {
                    info!(job_id = %request.id, cluster = %cluster, attempt, "placed on fallback cluster");
                }
                return Some(cluster);
            }
            debug!(job_id = %request.id, cluster = %cluster, "no capacity on live check; trying next");
        }
        None
    }

    async fn confirm(&self, cluster: &ClusterId, resources: &ResourceVector) -> bool {
        let (Ok(provider), Some(scheduler)) = (self.quota.provider(cluster), self.cluster(cluster))
        else {
            return false;
        };
        match provider.get_quota(cluster).await {
            Ok(mut snapshot) => {
                snapshot.used += scheduler.pending_demand();
                !snapshot.stale && snapshot.has_capacity(resources)
            }
            Err(e) => {
                debug!(cluster = %cluster, error = %e, "live quota check failed");
                false
            }
        }
    }

    fn best_effort(
        &self,
        request: &JobRequest,
        candidates: &[ClusterCandidate],
        eligible: &[ClusterId],
    ) -> ClusterId {
        let chosen = self
            .selector
            .best_effort(&request.resources, candidates)
            .or_else(|| {
                let snapshots = self.quota.all_snapshots();
                let known: Vec<ClusterCandidate> = eligible
                    .iter()
                    .filter_map(|id| {
                        snapshots
                            .get(id)
                            .map(|s| self.net_of_queue(ClusterCandidate::new(id.clone(), s.clone())))
                    })
                    .collect();
                self.selector.best_effort(&request.resources, &known)
            })
            .or_else(|| {
                request
                    .cluster_hint
                    .as_ref()
                    .filter(|hint| eligible.contains(hint))
                    .cloned()
            })
            .unwrap_or_else(|| eligible[0].clone());
        warn!(
            job_id = %request.id,
            cluster = %chosen,
            resources = %request.resources,
            "no cluster has capacity now; queued best-effort"
        );
        chosen
    }

    // ==================== Job operations ====================

    /// Status of a job.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::JobNotFound`] if the job is unknown or
    /// already drained.
    pub fn status(&self, job_id: &JobId) -> Result<JobStatus> {
        self.owner(job_id)?.status(job_id)
    }

    /// Cancel a job on its owning cluster.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::JobNotFound`] or
    /// [`SchedulerError::CannotCancel`].
    pub async fn cancel(&self, job_id: &JobId) -> Result<JobStatus> {
        self.owner(job_id)?.cancel(job_id).await
    }

    /// Run one admission pass on every cluster concurrently.
    pub async fn run_admission_passes(&self) -> BTreeMap<ClusterId, PassReport> {
        let schedulers = self.schedulers();
        let reports = join_all(schedulers.iter().map(|s| s.run_admission_pass())).await;
        schedulers
            .iter()
            .map(|s| s.cluster().clone())
            .zip(reports)
            .collect()
    }

    /// Poll running jobs on every cluster concurrently.
    pub async fn poll_all(&self) -> BTreeMap<ClusterId, PollReport> {
        let schedulers = self.schedulers();
        let reports = join_all(schedulers.iter().map(|s| s.poll_running())).await;
        schedulers
            .iter()
            .map(|s| s.cluster().clone())
            .zip(reports)
            .collect()
    }

    /// Remove and return every terminal job across clusters.
    pub fn drain_finished(&self) -> Vec<Job> {
        let drained: Vec<Job> = self
            .schedulers()
            .iter()
            .flat_map(|s| s.drain_finished())
            .collect();
        if !drained.is_empty() {
            let mut owners = self.owners.write();
            for job in &drained {
                owners.remove(&job.id);
            }
        }
        drained
    }

    /// Queued jobs per cluster.
    #[must_use]
    pub fn queue_lengths(&self) -> BTreeMap<ClusterId, usize> {
        self.schedulers()
            .iter()
            .map(|s| (s.cluster().clone(), s.queue_length()))
            .collect()
    }

    /// Quota usage per cluster from the cached snapshots.
    #[must_use]
    pub fn quota_usage(&self) -> Vec<ScopeUsage> {
        self.schedulers()
            .iter()
            .map(|s| {
                let snapshot = self.quota.snapshot(s.cluster());
                ScopeUsage {
                    cluster: s.cluster().clone(),
                    executor_type: s.executor_type(),
                    usage: snapshot.as_ref().map(QuotaSnapshot::usage_percentage),
                    snapshot,
                    queue_length: s.queue_length(),
                }
            })
            .collect()
    }

    /// Start every cluster loop and the quota refresh loop.
    pub fn spawn(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = self
            .schedulers()
            .into_iter()
            .map(|s| tokio::spawn(s.run(shutdown.clone())))
            .collect();
        handles.push(tokio::spawn(Arc::clone(&self.quota).run(shutdown.clone())));
        info!(tasks = handles.len(), "vdc scheduler loops started");
        handles
    }
}
