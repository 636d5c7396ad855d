//! Daemon configuration.
//!
//! One TOML file describes the scheduler, the quota manager, the executor
//! backends and the clusters that make up the virtual data center:
//! - `[scheduler]` and `[quota]` timing and policy knobs
//! - `[executors.*]` backend connections, built once at start-up
//! - `[[clusters]]` scopes, each with an executor type and a quota source

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vdc_executor::ExecutorsConfig;
use vdc_proto::{ClusterId, ExecutorType, ResourceVector};
use vdc_scheduler::{QuotaManagerConfig, SchedulerConfig};

use crate::error::{DaemonError, Result};

const fn default_quota_timeout_secs() -> u64 {
    10
}

/// Where a cluster's quota figures come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum QuotaSourceConfig {
    /// Fixed pool tracked in memory. Memory is in MiB.
    Local {
        /// CPU cores.
        #[serde(default)]
        cpu: f64,
        /// Memory in MiB.
        #[serde(default)]
        memory: f64,
        /// GPU devices.
        #[serde(default)]
        gpu: u32,
    },
    /// `ResourceQuota` objects of a Kubernetes namespace.
    Kubernetes {
        /// Namespace whose quotas bound the scope.
        namespace: String,
        /// Kubeconfig; defaults to the Kubernetes executor's.
        #[serde(default)]
        kubeconfig: Option<PathBuf>,
        /// Kubeconfig context; defaults to the Kubernetes executor's.
        #[serde(default)]
        context: Option<String>,
        /// Bound on one API request.
        #[serde(default = "default_quota_timeout_secs")]
        request_timeout_secs: u64,
    },
    /// Node inventory of a Slurm partition, via the Slurm executor's
    /// connection.
    Slurm {
        /// Partition whose nodes bound the scope.
        partition: String,
    },
}

impl QuotaSourceConfig {
    /// Source name, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Kubernetes { .. } => "kubernetes",
            Self::Slurm { .. } => "slurm",
        }
    }
}

/// One cluster scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Scope identifier.
    pub id: ClusterId,
    /// Executor backend that runs this cluster's jobs.
    pub executor: ExecutorType,
    /// Quota source.
    pub quota: QuotaSourceConfig,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VdcConfig {
    /// Admission, dispatch and placement settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Quota refresh and health settings.
    #[serde(default)]
    pub quota: QuotaManagerConfig,
    /// Executor backends.
    #[serde(default)]
    pub executors: ExecutorsConfig,
    /// Cluster scopes.
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

impl VdcConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DaemonError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| DaemonError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaemonError::Config(format!("failed to render config: {e}")))
    }

    /// Validate cross-section consistency.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.quota.validate()?;
        self.executors.validate()?;

        if self.clusters.is_empty() {
            return Err(DaemonError::Config("at least one cluster is required".to_string()));
        }

        let configured: BTreeSet<ExecutorType> =
            self.executors.configured_types().into_iter().collect();
        let mut seen = BTreeSet::new();
        for cluster in &self.clusters {
            if !seen.insert(&cluster.id) {
                return Err(DaemonError::Config(format!("duplicate cluster id '{}'", cluster.id)));
            }
            if !configured.contains(&cluster.executor) {
                return Err(DaemonError::Config(format!(
                    "cluster '{}' uses executor '{}' which has no [executors.{}] section",
                    cluster.id, cluster.executor, cluster.executor
                )));
            }
            self.validate_quota_source(cluster)?;
        }
        Ok(())
    }

    fn validate_quota_source(&self, cluster: &ClusterConfig) -> Result<()> {
        match &cluster.quota {
            QuotaSourceConfig::Local { cpu, memory, gpu } => {
                ResourceVector::new(*cpu, *memory, *gpu).map_err(|e| {
                    DaemonError::Config(format!("cluster '{}' local quota: {e}", cluster.id))
                })?;
            }
            QuotaSourceConfig::Kubernetes {
                namespace,
                kubeconfig,
                request_timeout_secs,
                ..
            } => {
                if namespace.is_empty() {
                    return Err(DaemonError::Config(format!(
                        "cluster '{}' kubernetes quota needs a namespace",
                        cluster.id
                    )));
                }
                if kubeconfig.is_none() && self.executors.kubernetes.is_none() {
                    return Err(DaemonError::Config(format!(
                        "cluster '{}' kubernetes quota has no kubeconfig and no [executors.kubernetes] to borrow one from",
                        cluster.id
                    )));
                }
                if *request_timeout_secs == 0 {
                    return Err(DaemonError::Config(format!(
                        "cluster '{}' kubernetes quota request timeout must be positive",
                        cluster.id
                    )));
                }
            }
            QuotaSourceConfig::Slurm { partition } => {
                if partition.is_empty() {
                    return Err(DaemonError::Config(format!(
                        "cluster '{}' slurm quota needs a partition",
                        cluster.id
                    )));
                }
                if self.executors.slurm.is_none() {
                    return Err(DaemonError::Config(format!(
                        "cluster '{}' slurm quota needs an [executors.slurm] connection",
                        cluster.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Annotated starting configuration written by `vdcd init-config`.
pub const SAMPLE_CONFIG: &str = r#"# vdcd configuration

[scheduler]
policy = "priority"            # fifo | priority
selection = "spread"           # spread | bin_pack
admission_interval_secs = 5
poll_interval_secs = 10
dispatch_timeout_secs = 30
poll_timeout_secs = 10
max_dispatch_retries = 3
fallback_count = 2

[quota]
refresh_interval_secs = 15
cache_ttl_secs = 10
request_timeout_secs = 5
max_staleness_secs = 120
failure_threshold = 3
cooldown_secs = 60
backoff_base_secs = 1
backoff_max_secs = 60

[executors.local]
working_dir = "/var/lib/vdc/jobs"
max_processes = 4

# [executors.kubernetes]
# kubeconfig = "/etc/vdc/kubeconfig"
# namespace = "ml-jobs"

# [executors.slurm]
# url = "http://slurm:6820"
# user = "vdc"
# token = "..."

[[clusters]]
id = "workstation"
executor = "local"
[clusters.quota]
source = "local"
cpu = 8
memory = 16384
gpu = 0

# [[clusters]]
# id = "gpu-east"
# executor = "kubernetes"
# [clusters.quota]
# source = "kubernetes"
# namespace = "ml-jobs"
"#;
