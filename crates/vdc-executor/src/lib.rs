//! # vdc-executor
//!
//! Executor dispatch layer: the backend adapters that actually launch jobs.
//!
//! | Type | Backend | Handle `external_id` |
//! |------|---------|----------------------|
//! | [`KubernetesExecutor`] | `batch/v1` Job | Job name |
//! | [`SlurmExecutor`] | `slurmrestd` batch job | Slurm job number |
//! | [`LocalExecutor`] | child process | process name |
//! | [`MockExecutor`] | in memory | `mock-N` |
//!
//! Executors are looked up through an [`ExecutorRegistry`] built once from
//! [`ExecutorsConfig`] and shared via `Arc`.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use vdc_executor::{ExecutorRegistry, MockExecutor};
//! use vdc_proto::ExecutorType;
//!
//! let registry = ExecutorRegistry::new();
//! registry.register(Arc::new(MockExecutor::new(ExecutorType::Kubernetes)));
//!
//! assert!(registry.get_executor(ExecutorType::Kubernetes).is_ok());
//! assert!(registry.get_executor(ExecutorType::Slurm).is_err());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
mod error;
mod executor;
pub mod kubernetes;
pub mod local;
pub mod mock;
mod registry;
pub mod slurm;

pub use config::{
    ExecutorsConfig, KubernetesExecutorConfig, LocalExecutorConfig, SlurmExecutorConfig,
};
pub use error::{ExecutorError, Result};
pub use executor::{Executor, ExecutorExt, JobSubmission, MAX_EXTERNAL_NAME};
pub use kubernetes::KubernetesExecutor;
pub use local::LocalExecutor;
pub use mock::MockExecutor;
pub use registry::ExecutorRegistry;
pub use slurm::SlurmExecutor;
