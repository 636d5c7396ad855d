//! # vdc-quota
//!
//! Quota providers: where the scheduler learns how much capacity a scope
//! has and records what it has optimistically handed out.
//!
//! ## Providers
//!
//! - [`LocalQuotaProvider`]: fixed pools accounted entirely in process
//! - [`RemoteQuotaProvider`]: a [`QuotaBackend`] plus a reservation overlay,
//!   with [`KubernetesQuotaBackend`] and [`SlurmQuotaBackend`]
//!
//! ## Two-phase admission
//!
//! ```text
//! reserve ──► dispatch ──┬─ ok ────► commit ──► ... ──► release (job done)
//!                        └─ error ─► release (compensation)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use vdc_proto::{ClusterId, ResourceVector};
//! use vdc_quota::{LocalQuotaProvider, QuotaProvider};
//!
//! let scope = ClusterId::new("lab")?;
//! let provider = LocalQuotaProvider::new()
//!     .with_scope(scope.clone(), "cpu=8,gpu=2".parse()?)?;
//!
//! let reservation = provider.reserve(&scope, &"cpu=4,gpu=1".parse()?)?;
//! assert!(provider.release(&reservation)?);
//! assert!(!provider.release(&reservation)?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod kubernetes;
mod local;
mod provider;
pub mod remote;
pub mod slurm;

pub use error::{QuotaError, Result};
pub use kubernetes::KubernetesQuotaBackend;
pub use local::LocalQuotaProvider;
pub use provider::{QuotaProvider, QuotaProviderExt, Reservation};
pub use remote::{BackendUsage, QuotaBackend, RemoteQuotaConfig, RemoteQuotaProvider};
pub use slurm::SlurmQuotaBackend;
