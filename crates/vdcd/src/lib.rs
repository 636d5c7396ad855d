//! # vdcd
//!
//! The VDC scheduler daemon: loads a TOML configuration, builds the executor
//! registry and one quota provider per cluster, then runs the admission,
//! status polling and quota refresh loops until shutdown.
//!
//! ```rust,no_run
//! use vdcd::{Daemon, VdcConfig};
//!
//! # async fn example() -> vdcd::Result<()> {
//! let config = VdcConfig::from_file("/etc/vdc/vdcd.toml")?;
//! let daemon = Daemon::build(config, false)?;
//! let (_tx, rx) = tokio::sync::watch::channel(false);
//! daemon.run(rx, std::time::Duration::from_secs(60)).await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
mod daemon;
mod error;

pub use config::{ClusterConfig, QuotaSourceConfig, VdcConfig, SAMPLE_CONFIG};
pub use daemon::Daemon;
pub use error::{DaemonError, Result};
