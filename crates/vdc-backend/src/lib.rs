//! # vdc-backend
//!
//! REST clients for the cluster managers the VDC scheduler drives.
//!
//! - [`KubeClient`]: Kubernetes API server (`ResourceQuota`, `batch/v1` Jobs),
//!   configured from a kubeconfig via [`Kubeconfig`]
//! - [`SlurmClient`]: `slurmrestd` (job submit/status/cancel, node inventory)
//!
//! Both clients are cheap to clone and share one connection pool per
//! instance. Quota providers and executors built on the same backend may
//! share a client.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod http;
pub mod kubeconfig;
pub mod kubernetes;
pub mod slurm;

pub use error::{BackendError, Result};
pub use kubeconfig::{ClusterConnection, Kubeconfig};
pub use kubernetes::{JobCondition, KubeClient, KubeJob, KubeJobStatus, ObjectMeta, ResourceQuota};
pub use slurm::{SlurmClient, SlurmConnection, SlurmJob, SlurmNode, SlurmState};
