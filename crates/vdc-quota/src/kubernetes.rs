//! Capacity from Kubernetes `ResourceQuota` objects.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use vdc_backend::{KubeClient, ResourceQuota};
use vdc_proto::quantity::{parse_count, parse_cpu, parse_mib};
use vdc_proto::{ClusterId, ResourceVector};

use crate::error::{QuotaError, Result};
use crate::remote::{BackendUsage, QuotaBackend};

const CPU_KEYS: [&str; 2] = ["requests.cpu", "cpu"];
const MEMORY_KEYS: [&str; 2] = ["requests.memory", "memory"];
const GPU_KEYS: [&str; 2] = ["requests.nvidia.com/gpu", "nvidia.com/gpu"];

/// [`QuotaBackend`] reading the `ResourceQuota` objects of one namespace per
/// scope.
///
/// When several quotas constrain the same resource, the tightest limit wins.
/// A resource no quota constrains is treated as unlimited.
#[derive(Debug, Clone)]
pub struct KubernetesQuotaBackend {
    client: KubeClient,
    namespaces: HashMap<ClusterId, String>,
}

impl KubernetesQuotaBackend {
    /// Create a backend with no scopes.
    #[must_use]
    pub fn new(client: KubeClient) -> Self {
        Self {
            client,
            namespaces: HashMap::new(),
        }
    }

    /// Map a scope to a namespace.
    #[must_use]
    pub fn with_scope(mut self, scope: ClusterId, namespace: impl Into<String>) -> Self {
        self.namespaces.insert(scope, namespace.into());
        self
    }
}

impl QuotaBackend for KubernetesQuotaBackend {
    fn kind(&self) -> &'static str {
        "kubernetes"
    }

    fn scopes(&self) -> Vec<ClusterId> {
        self.namespaces.keys().cloned().collect()
    }

    fn fetch<'a>(
        &'a self,
        scope: &'a ClusterId,
    ) -> Pin<Box<dyn Future<Output = Result<BackendUsage>> + Send + 'a>> {
        Box::pin(async move {
            let namespace = self
                .namespaces
                .get(scope)
                .ok_or_else(|| QuotaError::UnknownScope(scope.clone()))?;
            let quotas = self
                .client
                .list_resource_quotas(namespace)
                .await
                .map_err(|e| QuotaError::BackendUnavailable {
                    scope: scope.clone(),
                    reason: e.to_string(),
                })?;
            usage_from_quotas(namespace, &quotas)
        })
    }
}

/// Combine a namespace's `ResourceQuota` objects into one limit/usage pair.
///
/// # Errors
///
/// `InvalidQuota` if the namespace has no quota or a quantity is malformed.
pub fn usage_from_quotas(namespace: &str, quotas: &[ResourceQuota]) -> Result<BackendUsage> {
    if quotas.is_empty() {
        return Err(QuotaError::InvalidQuota(format!(
            "namespace {namespace} has no ResourceQuota"
        )));
    }

    let mut cpu: Option<(f64, f64)> = None;
    let mut memory: Option<(f64, f64)> = None;
    let mut gpu: Option<(u32, u32)> = None;

    for status in quotas.iter().filter_map(|q| q.status.as_ref()) {
        let invalid = |e: vdc_proto::ProtoError| QuotaError::InvalidQuota(format!("{namespace}: {e}"));
        if let Some((hard, used)) = lookup(&status.hard, &status.used, &CPU_KEYS) {
            let pair = (parse_cpu(hard).map_err(invalid)?, parse_cpu(used).map_err(invalid)?);
            cpu = Some(tighter(cpu, pair));
        }
        if let Some((hard, used)) = lookup(&status.hard, &status.used, &MEMORY_KEYS) {
            let pair = (parse_mib(hard).map_err(invalid)?, parse_mib(used).map_err(invalid)?);
            memory = Some(tighter(memory, pair));
        }
        if let Some((hard, used)) = lookup(&status.hard, &status.used, &GPU_KEYS) {
            let pair = (
                parse_count(hard).map_err(invalid)?,
                parse_count(used).map_err(invalid)?,
            );
            gpu = Some(match gpu {
                Some((h, u)) => (h.min(pair.0), u.max(pair.1)),
                None => pair,
            });
        }
    }

    let (cpu_hard, cpu_used) = cpu.unwrap_or((f64::MAX, 0.0));
    let (mem_hard, mem_used) = memory.unwrap_or((f64::MAX, 0.0));
    let (gpu_hard, gpu_used) = gpu.unwrap_or((u32::MAX, 0));

    Ok(BackendUsage {
        limits: ResourceVector::ZERO
            .with_cpu(cpu_hard)
            .with_memory(mem_hard)
            .with_gpu(gpu_hard),
        used: ResourceVector::ZERO
            .with_cpu(cpu_used)
            .with_memory(mem_used)
            .with_gpu(gpu_used),
    })
}

fn lookup<'a>(
    hard: &'a std::collections::BTreeMap<String, String>,
    used: &'a std::collections::BTreeMap<String, String>,
    keys: &[&str],
) -> Option<(&'a str, &'a str)> {
    keys.iter().find_map(|key| {
        hard.get(*key)
            .map(|h| (h.as_str(), used.get(*key).map_or("0", String::as_str)))
    })
}

fn tighter(current: Option<(f64, f64)>, next: (f64, f64)) -> (f64, f64) {
    match current {
        Some((hard, used)) => (hard.min(next.0), used.max(next.1)),
        None => next,
    }
}
