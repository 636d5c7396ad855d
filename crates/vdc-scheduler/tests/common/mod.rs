//! Shared fixtures for scheduler integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use vdc_executor::{ExecutorRegistry, MockExecutor};
use vdc_proto::{ClusterId, ExecutorType, JobId, JobRequest, JobState, ResourceVector};
use vdc_quota::{BackendUsage, LocalQuotaProvider, QuotaBackend, QuotaError};
use vdc_scheduler::{QuotaManagerConfig, SchedulerConfig, VdcScheduler};

pub fn cluster(name: &str) -> ClusterId {
    ClusterId::new(name).unwrap_or_else(|_| unreachable!())
}

pub fn job_id(name: &str) -> JobId {
    JobId::new(name).unwrap_or_else(|_| unreachable!())
}

pub fn rv(cpu: f64, memory: f64, gpu: u32) -> ResourceVector {
    ResourceVector::new(cpu, memory, gpu).unwrap_or_else(|_| unreachable!())
}

pub fn request(name: &str, resources: ResourceVector) -> JobRequest {
    JobRequest::new(job_id(name), resources, ExecutorType::Local)
}

pub fn local_provider(name: &str, limits: ResourceVector) -> Arc<LocalQuotaProvider> {
    Arc::new(
        LocalQuotaProvider::new()
            .with_scope(cluster(name), limits)
            .unwrap_or_else(|_| unreachable!()),
    )
}

/// A VDC with a mock `Local` executor and no clusters.
pub struct Harness {
    pub vdc: VdcScheduler,
    pub registry: Arc<ExecutorRegistry>,
    pub mock: Arc<MockExecutor>,
}

impl Harness {
    pub fn new(config: SchedulerConfig, quota: QuotaManagerConfig) -> Self {
        let registry = Arc::new(ExecutorRegistry::new());
        let mock = Arc::new(MockExecutor::new(ExecutorType::Local));
        registry.register(mock.clone());
        let vdc = VdcScheduler::new(config, quota, Arc::clone(&registry))
            .unwrap_or_else(|_| unreachable!());
        Self {
            vdc,
            registry,
            mock,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SchedulerConfig::default(), QuotaManagerConfig::default())
    }

    /// Register a local-pool cluster and return its provider.
    pub fn add_local(&self, name: &str, limits: ResourceVector) -> Arc<LocalQuotaProvider> {
        let provider = local_provider(name, limits);
        self.vdc
            .add_cluster(cluster(name), ExecutorType::Local, provider.clone())
            .unwrap_or_else(|_| unreachable!());
        provider
    }

    pub fn state(&self, name: &str) -> Option<JobState> {
        self.vdc.status(&job_id(name)).ok().map(|s| s.state)
    }
}

/// Quota backend whose figures can be changed or cut off.
pub struct SwitchableBackend {
    scope: ClusterId,
    usage: Mutex<Option<BackendUsage>>,
    delay: Mutex<Duration>,
}

impl SwitchableBackend {
    pub fn new(scope: ClusterId, limits: ResourceVector) -> Self {
        Self {
            scope,
            usage: Mutex::new(Some(BackendUsage {
                limits,
                used: ResourceVector::ZERO,
            })),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Make fetches fail.
    pub fn go_down(&self) {
        *self.usage.lock() = None;
    }

    /// Make fetches succeed with these figures.
    pub fn report(&self, limits: ResourceVector, used: ResourceVector) {
        *self.usage.lock() = Some(BackendUsage { limits, used });
    }

    /// Delay every fetch.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }
}

impl QuotaBackend for SwitchableBackend {
    fn kind(&self) -> &'static str {
        "switchable"
    }

    fn scopes(&self) -> Vec<ClusterId> {
        vec![self.scope.clone()]
    }

    fn fetch<'a>(
        &'a self,
        scope: &'a ClusterId,
    ) -> Pin<Box<dyn Future<Output = vdc_quota::Result<BackendUsage>> + Send + 'a>> {
        Box::pin(async move {
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let usage = *self.usage.lock();
            usage.ok_or_else(|| QuotaError::BackendUnavailable {
                scope: scope.clone(),
                reason: "connection refused".to_string(),
            })
        })
    }
}
