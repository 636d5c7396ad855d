//! Executor configuration, supplied once at process start.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vdc_backend::slurm::DEFAULT_API_VERSION;
use vdc_proto::ExecutorType;

use crate::error::{ExecutorError, Result};
use crate::slurm::DEFAULT_WORKING_DIR;

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_slurm_working_dir() -> String {
    DEFAULT_WORKING_DIR.to_string()
}

fn default_local_working_dir() -> PathBuf {
    std::env::temp_dir()
}

const fn default_max_processes() -> usize {
    4
}

/// Kubernetes executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesExecutorConfig {
    /// Path to the kubeconfig file.
    pub kubeconfig: PathBuf,
    /// Namespace for jobs; defaults to the context's namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Kubeconfig context; defaults to `current-context`.
    #[serde(default)]
    pub context: Option<String>,
    /// `imagePullPolicy` for job containers.
    #[serde(default)]
    pub image_pull_policy: Option<String>,
    /// Bound on one API request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Slurm executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlurmExecutorConfig {
    /// `slurmrestd` base URL.
    pub url: String,
    /// REST API version segment.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// User name sent as `X-SLURM-USER-NAME`.
    pub user: String,
    /// JWT sent as `X-SLURM-USER-TOKEN`.
    #[serde(default)]
    pub token: Option<String>,
    /// Partition jobs are submitted to.
    #[serde(default)]
    pub partition: Option<String>,
    /// Working directory for jobs that do not set one.
    #[serde(default = "default_slurm_working_dir")]
    pub working_dir: String,
    /// Bound on one API request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Local executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalExecutorConfig {
    /// Working directory for jobs that do not set one.
    #[serde(default = "default_local_working_dir")]
    pub working_dir: PathBuf,
    /// Maximum concurrent processes.
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,
}

impl Default for LocalExecutorConfig {
    fn default() -> Self {
        Self {
            working_dir: default_local_working_dir(),
            max_processes: default_max_processes(),
        }
    }
}

/// All executor backends; an absent section leaves that type unconfigured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorsConfig {
    /// Kubernetes backend.
    #[serde(default)]
    pub kubernetes: Option<KubernetesExecutorConfig>,
    /// Slurm backend.
    #[serde(default)]
    pub slurm: Option<SlurmExecutorConfig>,
    /// Local process backend.
    #[serde(default)]
    pub local: Option<LocalExecutorConfig>,
}

impl KubernetesExecutorConfig {
    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl SlurmExecutorConfig {
    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ExecutorsConfig {
    /// Executor types with a configuration section, in declaration order.
    #[must_use]
    pub fn configured_types(&self) -> Vec<ExecutorType> {
        let mut types = Vec::new();
        if self.kubernetes.is_some() {
            types.push(ExecutorType::Kubernetes);
        }
        if self.slurm.is_some() {
            types.push(ExecutorType::Slurm);
        }
        if self.local.is_some() {
            types.push(ExecutorType::Local);
        }
        types
    }

    /// Validate every present section.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if let Some(k8s) = &self.kubernetes {
            if k8s.kubeconfig.as_os_str().is_empty() {
                return Err(ExecutorError::Config(
                    "executors.kubernetes.kubeconfig cannot be empty".to_string(),
                ));
            }
            if k8s.namespace.as_deref().is_some_and(str::is_empty) {
                return Err(ExecutorError::Config(
                    "executors.kubernetes.namespace cannot be empty".to_string(),
                ));
            }
            if k8s.request_timeout_secs == 0 {
                return Err(ExecutorError::Config(
                    "executors.kubernetes.request_timeout_secs must be positive".to_string(),
                ));
            }
        }

        if let Some(slurm) = &self.slurm {
            url::Url::parse(&slurm.url).map_err(|e| {
                ExecutorError::Config(format!("executors.slurm.url '{}' is invalid: {e}", slurm.url))
            })?;
            if slurm.user.trim().is_empty() {
                return Err(ExecutorError::Config(
                    "executors.slurm.user cannot be empty".to_string(),
                ));
            }
            if slurm.request_timeout_secs == 0 {
                return Err(ExecutorError::Config(
                    "executors.slurm.request_timeout_secs must be positive".to_string(),
                ));
            }
        }

        if let Some(local) = &self.local {
            if local.max_processes == 0 {
                return Err(ExecutorError::Config(
                    "executors.local.max_processes must be positive".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> ExecutorsConfig {
        toml::from_str(toml_str).unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn test_empty_config_has_no_types() {
        let config = ExecutorsConfig::default();
        assert!(config.configured_types().is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_all_sections_with_defaults() {
        let config = parse(
            r#"
[kubernetes]
kubeconfig = "/etc/vdc/kubeconfig"
namespace = "ml-jobs"

[slurm]
url = "http://slurm:6820"
user = "vdc"
token = "jwt"

[local]
max_processes = 2
"#,
        );
        assert_eq!(
            config.configured_types(),
            vec![ExecutorType::Kubernetes, ExecutorType::Slurm, ExecutorType::Local]
        );
        let slurm = config.slurm.clone().unwrap_or_else(|| unreachable!());
        assert_eq!(slurm.api_version, DEFAULT_API_VERSION);
        assert_eq!(slurm.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.local.as_ref().map(|l| l.max_processes), Some(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_slurm_url() {
        let config = parse(
            r#"
[slurm]
url = "not a url"
user = "vdc"
"#,
        );
        assert!(matches!(config.validate(), Err(ExecutorError::Config(_))));
    }

    #[test]
    fn test_zero_local_processes() {
        let config = parse("[local]\nmax_processes = 0\n");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_slurm_user() {
        let config = parse("[slurm]\nurl = \"http://slurm:6820\"\nuser = \" \"\n");
        assert!(config.validate().is_err());
    }
}
