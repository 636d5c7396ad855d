//! Registry of configured executors, one per [`ExecutorType`].
//!
//! The registry is an ordinary value shared through `Arc`; components that
//! dispatch jobs receive it at construction.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};
use vdc_backend::{KubeClient, SlurmClient, SlurmConnection};
use vdc_proto::ExecutorType;

use crate::config::ExecutorsConfig;
use crate::error::{ExecutorError, Result};
use crate::executor::Executor;
use crate::kubernetes::KubernetesExecutor;
use crate::local::LocalExecutor;
use crate::slurm::SlurmExecutor;

/// Map from executor type to a shared executor instance.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<ExecutorType, Arc<dyn Executor>>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("configured", &self.configured_types())
            .finish()
    }
}

impl ExecutorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and register every backend present in `config`.
    ///
    /// Backends are built before any is registered, so a failure leaves the
    /// registry unchanged. Returns the types registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a backend client
    /// cannot be built.
    pub fn initialize(&self, config: &ExecutorsConfig) -> Result<Vec<ExecutorType>> {
        config.validate()?;

        let mut built: Vec<Arc<dyn Executor>> = Vec::new();

        if let Some(k8s) = &config.kubernetes {
            let client = KubeClient::from_kubeconfig(
                &k8s.kubeconfig,
                k8s.context.as_deref(),
                k8s.request_timeout(),
            )?;
            let namespace = k8s
                .namespace
                .clone()
                .or_else(|| client.default_namespace().map(str::to_string))
                .unwrap_or_else(|| "default".to_string());
            let mut executor = KubernetesExecutor::new(client, namespace);
            if let Some(policy) = &k8s.image_pull_policy {
                executor = executor.with_image_pull_policy(policy);
            }
            built.push(Arc::new(executor));
        }

        if let Some(slurm) = &config.slurm {
            let url = url::Url::parse(&slurm.url)
                .map_err(|e| ExecutorError::Config(format!("invalid slurm url: {e}")))?;
            let mut connection =
                SlurmConnection::new(url, &slurm.user).with_api_version(&slurm.api_version);
            if let Some(token) = &slurm.token {
                connection = connection.with_token(token);
            }
            let client = SlurmClient::new(connection, slurm.request_timeout())?;
            let mut executor = SlurmExecutor::new(client).with_working_dir(&slurm.working_dir);
            if let Some(partition) = &slurm.partition {
                executor = executor.with_partition(partition);
            }
            built.push(Arc::new(executor));
        }

        if let Some(local) = &config.local {
            built.push(Arc::new(LocalExecutor::new(
                &local.working_dir,
                local.max_processes,
            )));
        }

        let types = built.iter().map(|e| e.executor_type()).collect();
        for executor in built {
            self.register(executor);
        }
        info!(executors = ?types, "executor registry initialized");
        Ok(types)
    }

    /// Register an executor under its own type, returning the one it
    /// replaced.
    pub fn register(&self, executor: Arc<dyn Executor>) -> Option<Arc<dyn Executor>> {
        let executor_type = executor.executor_type();
        let previous = self.executors.write().insert(executor_type, executor);
        if previous.is_some() {
            warn!(executor_type = %executor_type, "replaced registered executor");
        } else {
            info!(executor_type = %executor_type, "registered executor");
        }
        previous
    }

    /// Get the executor for a type; repeated calls return the same instance.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::ExecutorNotConfigured`] if none is registered.
    pub fn get_executor(&self, executor_type: ExecutorType) -> Result<Arc<dyn Executor>> {
        self.executors
            .read()
            .get(&executor_type)
            .cloned()
            .ok_or(ExecutorError::ExecutorNotConfigured(executor_type))
    }

    /// Check if a type has an executor.
    #[must_use]
    pub fn is_configured(&self, executor_type: ExecutorType) -> bool {
        self.executors.read().contains_key(&executor_type)
    }

    /// Registered types, sorted.
    #[must_use]
    pub fn configured_types(&self) -> Vec<ExecutorType> {
        let mut types: Vec<ExecutorType> = self.executors.read().keys().copied().collect();
        types.sort();
        types
    }

    /// Drop every registered executor.
    pub fn reset(&self) {
        let dropped = {
            let mut executors = self.executors.write();
            let n = executors.len();
            executors.clear();
            n
        };
        info!(dropped, "executor registry reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalExecutorConfig;
    use crate::mock::MockExecutor;

    #[test]
    fn test_get_unregistered_fails() {
        let registry = ExecutorRegistry::new();
        assert!(matches!(
            registry.get_executor(ExecutorType::Slurm),
            Err(ExecutorError::ExecutorNotConfigured(ExecutorType::Slurm))
        ));
    }

    #[test]
    fn test_get_returns_same_instance() {
        let registry = ExecutorRegistry::new();
        registry.register(Arc::new(MockExecutor::new(ExecutorType::Kubernetes)));

        let a = registry
            .get_executor(ExecutorType::Kubernetes)
            .unwrap_or_else(|_| unreachable!());
        let b = registry
            .get_executor(ExecutorType::Kubernetes)
            .unwrap_or_else(|_| unreachable!());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_register_replaces() {
        let registry = ExecutorRegistry::new();
        assert!(registry
            .register(Arc::new(MockExecutor::new(ExecutorType::Local)))
            .is_none());
        assert!(registry
            .register(Arc::new(MockExecutor::new(ExecutorType::Local)))
            .is_some());
        assert_eq!(registry.configured_types(), vec![ExecutorType::Local]);
    }

    #[test]
    fn test_reset_clears() {
        let registry = ExecutorRegistry::new();
        registry.register(Arc::new(MockExecutor::new(ExecutorType::Slurm)));
        assert!(registry.is_configured(ExecutorType::Slurm));
        registry.reset();
        assert!(!registry.is_configured(ExecutorType::Slurm));
        assert!(registry.configured_types().is_empty());
    }

    #[test]
    fn test_initialize_local() {
        let registry = ExecutorRegistry::new();
        let config = ExecutorsConfig {
            local: Some(LocalExecutorConfig::default()),
            ..ExecutorsConfig::default()
        };
        let types = registry.initialize(&config).unwrap_or_default();
        assert_eq!(types, vec![ExecutorType::Local]);
        assert!(registry.is_configured(ExecutorType::Local));
        assert!(!registry.is_configured(ExecutorType::Kubernetes));
    }

    #[test]
    fn test_initialize_failure_leaves_registry_unchanged() {
        let registry = ExecutorRegistry::new();
        registry.register(Arc::new(MockExecutor::new(ExecutorType::Local)));
        let config: ExecutorsConfig = toml::from_str(
            "[kubernetes]\nkubeconfig = \"/nonexistent/vdc/kubeconfig\"\n[local]\n",
        )
        .unwrap_or_else(|_| unreachable!());

        assert!(registry.initialize(&config).is_err());
        assert_eq!(registry.configured_types(), vec![ExecutorType::Local]);
    }
}
