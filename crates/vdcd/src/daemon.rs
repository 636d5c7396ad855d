//! Assembles the scheduler from configuration and drives it until shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use vdc_backend::{KubeClient, SlurmClient, SlurmConnection};
use vdc_executor::{ExecutorRegistry, MockExecutor, SlurmExecutorConfig};
use vdc_proto::{JobRequest, ResourceVector};
use vdc_quota::{
    KubernetesQuotaBackend, LocalQuotaProvider, QuotaProvider, RemoteQuotaProvider,
    SlurmQuotaBackend,
};
use vdc_scheduler::VdcScheduler;

use crate::config::{ClusterConfig, QuotaSourceConfig, VdcConfig};
use crate::error::{DaemonError, Result};

/// A fully wired scheduler.
pub struct Daemon {
    config: VdcConfig,
    registry: Arc<ExecutorRegistry>,
    vdc: Arc<VdcScheduler>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("clusters", &self.config.clusters.len())
            .field("executors", &self.registry.configured_types())
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Build executors, quota providers and the scheduler.
    ///
    /// With `dry_run`, every configured executor type is served by an
    /// in-memory [`MockExecutor`] instead of a real backend. Quota is still
    /// read from the configured sources.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend client cannot be built or a cluster
    /// cannot be registered.
    pub fn build(config: VdcConfig, dry_run: bool) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(ExecutorRegistry::new());
        if dry_run {
            for executor_type in config.executors.configured_types() {
                registry.register(Arc::new(MockExecutor::new(executor_type)));
            }
            warn!(executors = ?registry.configured_types(), "dry run: jobs go to mock executors");
        } else {
            registry.initialize(&config.executors)?;
        }

        let vdc = VdcScheduler::new(
            config.scheduler.clone(),
            config.quota.clone(),
            Arc::clone(&registry),
        )?;
        for cluster in &config.clusters {
            let provider = quota_provider(cluster, &config)?;
            vdc.add_cluster(cluster.id.clone(), cluster.executor, provider)?;
            info!(
                cluster = %cluster.id,
                executor = %cluster.executor,
                quota = cluster.quota.kind(),
                "cluster configured"
            );
        }

        Ok(Self {
            config,
            registry,
            vdc: Arc::new(vdc),
        })
    }

    /// The scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<VdcScheduler> {
        &self.vdc
    }

    /// The executor registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    /// Submit every job in a JSON array of job requests.
    ///
    /// Rejected jobs are logged and skipped. Returns the number accepted.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Jobs`] if the file cannot be read or parsed.
    pub async fn submit_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::Jobs(format!("failed to read '{}': {e}", path.display())))?;
        let requests: Vec<JobRequest> = serde_json::from_str(&content)
            .map_err(|e| DaemonError::Jobs(format!("invalid job file '{}': {e}", path.display())))?;

        let mut accepted = 0;
        for request in requests {
            let job_id = request.id.clone();
            match self.vdc.submit(request).await {
                Ok(status) => {
                    accepted += 1;
                    debug!(job_id = %job_id, cluster = ?status.cluster, "job accepted");
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "job rejected"),
            }
        }
        info!(file = %path.display(), accepted, "job file submitted");
        Ok(accepted)
    }

    /// Run every background loop until `shutdown` flips to `true`.
    ///
    /// Every `report_interval` the daemon logs per-cluster usage and hands
    /// finished jobs off to the log.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, report_interval: Duration) {
        let handles = self.vdc.spawn(&shutdown);

        let mut ticker = tokio::time::interval(report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.report(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("shutting down scheduler loops");
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        self.report();
    }

    /// Log usage per cluster and drain finished jobs.
    pub fn report(&self) {
        for scope in self.vdc.quota_usage() {
            info!(
                cluster = %scope.cluster,
                executor = %scope.executor_type,
                queued = scope.queue_length,
                used = %scope.snapshot.as_ref().map_or(ResourceVector::ZERO, |s| s.used),
                limits = %scope.snapshot.as_ref().map_or(ResourceVector::ZERO, |s| s.limits),
                stale = scope.snapshot.as_ref().is_some_and(|s| s.stale),
                "cluster usage"
            );
        }
        for job in self.vdc.drain_finished() {
            match serde_json::to_string(&job.status()) {
                Ok(record) => info!(job_id = %job.id, state = %job.state, record = %record, "job finished"),
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to serialize finished job"),
            }
        }
    }
}

fn quota_provider(cluster: &ClusterConfig, config: &VdcConfig) -> Result<Arc<dyn QuotaProvider>> {
    let remote_config = config.quota.remote_quota_config();
    match &cluster.quota {
        QuotaSourceConfig::Local { cpu, memory, gpu } => {
            let limits = ResourceVector::new(*cpu, *memory, *gpu)
                .map_err(|e| DaemonError::Config(format!("cluster '{}': {e}", cluster.id)))?;
            let provider = LocalQuotaProvider::new().with_scope(cluster.id.clone(), limits)?;
            Ok(Arc::new(provider))
        }
        QuotaSourceConfig::Kubernetes {
            namespace,
            kubeconfig,
            context,
            request_timeout_secs,
        } => {
            let executor = config.executors.kubernetes.as_ref();
            let path = kubeconfig
                .clone()
                .or_else(|| executor.map(|k| k.kubeconfig.clone()))
                .ok_or_else(|| {
                    DaemonError::Config(format!("cluster '{}' has no kubeconfig", cluster.id))
                })?;
            let context = context
                .as_deref()
                .or_else(|| executor.and_then(|k| k.context.as_deref()));
            let client = KubeClient::from_kubeconfig(
                &path,
                context,
                Duration::from_secs(*request_timeout_secs),
            )?;
            let backend =
                KubernetesQuotaBackend::new(client).with_scope(cluster.id.clone(), namespace);
            Ok(Arc::new(RemoteQuotaProvider::new(backend, remote_config)))
        }
        QuotaSourceConfig::Slurm { partition } => {
            let slurm = config.executors.slurm.as_ref().ok_or_else(|| {
                DaemonError::Config(format!(
                    "cluster '{}' needs an [executors.slurm] connection",
                    cluster.id
                ))
            })?;
            let backend = SlurmQuotaBackend::new(slurm_client(slurm)?)
                .with_scope(cluster.id.clone(), partition);
            Ok(Arc::new(RemoteQuotaProvider::new(backend, remote_config)))
        }
    }
}

fn slurm_client(slurm: &SlurmExecutorConfig) -> Result<SlurmClient> {
    let url = url::Url::parse(&slurm.url)
        .map_err(|e| DaemonError::Config(format!("invalid slurm url: {e}")))?;
    let mut connection = SlurmConnection::new(url, &slurm.user).with_api_version(&slurm.api_version);
    if let Some(token) = &slurm.token {
        connection = connection.with_token(token);
    }
    Ok(SlurmClient::new(connection, slurm.request_timeout())?)
}
