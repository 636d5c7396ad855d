//! # vdc-proto
//!
//! Shared value types for the VDC scheduler.
//!
//! - **Resources**: [`ResourceVector`] arithmetic and [`QuotaSnapshot`]
//! - **Jobs**: [`JobRequest`], [`Job`] and the lifecycle in [`JobState`]
//! - **Clusters**: [`ClusterId`] and the closed set of [`ExecutorType`]s
//!
//! ## Example
//!
//! ```rust
//! use vdc_proto::{QuotaSnapshot, ResourceVector};
//!
//! let limits: ResourceVector = "cpu=8,memory=32Gi,gpu=2".parse()?;
//! let used: ResourceVector = "cpu=4,gpu=1".parse()?;
//! let snapshot = QuotaSnapshot::new(limits, used);
//!
//! let request: ResourceVector = "cpu=2,memory=4Gi,gpu=1".parse()?;
//! assert!(snapshot.has_capacity(&request));
//! # Ok::<(), vdc_proto::ProtoError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cluster;
mod error;
mod job;
pub mod quantity;
mod resources;

pub use cluster::{ClusterId, ExecutorType, MAX_ID_LENGTH};
pub use error::{ProtoError, Result};
pub use job::{
    ExecutorHandle, ExecutorStatus, Job, JobId, JobPayload, JobRequest, JobState, JobStatus,
    StateTransition,
};
pub use resources::{QuotaSnapshot, ResourceUsage, ResourceVector};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
