//! # vdc-scheduler
//!
//! Multi-cluster job scheduling for a virtual data center (VDC).
//!
//! - [`VdcScheduler`]: accepts submissions, picks a cluster and owns one
//!   [`JobScheduler`] per cluster
//! - [`JobScheduler`]: queue, admission passes and the reserve → dispatch →
//!   commit-or-compensate protocol for one cluster
//! - [`VdcQuotaManager`]: cached per-cluster quota with backoff and cooldown
//! - [`ClusterSelector`]: spread or bin-pack ranking of candidate clusters
//! - [`SchedulingPolicy`]: FIFO or priority queue ordering
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use vdc_executor::{ExecutorRegistry, MockExecutor};
//! use vdc_proto::{ClusterId, ExecutorType, JobId, JobRequest, JobState, ResourceVector};
//! use vdc_quota::LocalQuotaProvider;
//! use vdc_scheduler::{QuotaManagerConfig, SchedulerConfig, VdcScheduler};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(ExecutorRegistry::new());
//! registry.register(Arc::new(MockExecutor::new(ExecutorType::Local)));
//!
//! let vdc = VdcScheduler::new(SchedulerConfig::default(), QuotaManagerConfig::default(), registry)?;
//! let cluster = ClusterId::new("workstation")?;
//! let provider = LocalQuotaProvider::new()
//!     .with_scope(cluster.clone(), ResourceVector::ZERO.with_cpu(8.0))?;
//! vdc.add_cluster(cluster, ExecutorType::Local, Arc::new(provider))?;
//!
//! let request = JobRequest::new(
//!     JobId::new("train-1")?,
//!     "cpu=2,memory=4Gi".parse()?,
//!     ExecutorType::Local,
//! );
//! let status = vdc.submit(request).await?;
//! assert_eq!(status.state, JobState::Queued);
//!
//! vdc.run_admission_passes().await;
//! assert_eq!(vdc.status(&status.id)?.state, JobState::Running);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod job_scheduler;
mod policy;
mod quota_manager;
mod selector;
mod vdc;

pub use config::{QuotaManagerConfig, SchedulerConfig};
pub use error::{Result, SchedulerError};
pub use job_scheduler::{JobScheduler, PassReport, PollReport};
pub use policy::{FifoPolicy, PolicyKind, PriorityPolicy, SchedulingPolicy};
pub use quota_manager::{ClusterHealth, RefreshSummary, VdcQuotaManager};
pub use selector::{
    headroom_after, BinPack, ClusterCandidate, ClusterSelector, SelectionKind, SelectionStrategy,
    Spread,
};
pub use vdc::{ScopeUsage, VdcScheduler};
