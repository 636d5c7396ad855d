//! Capacity from the Slurm node inventory.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use vdc_backend::{SlurmClient, SlurmNode};
use vdc_proto::{ClusterId, ResourceVector};

use crate::error::{QuotaError, Result};
use crate::remote::{BackendUsage, QuotaBackend};

/// [`QuotaBackend`] summing the nodes of one partition per scope.
///
/// Nodes that are down or draining contribute neither capacity nor usage.
#[derive(Debug, Clone)]
pub struct SlurmQuotaBackend {
    client: SlurmClient,
    partitions: HashMap<ClusterId, String>,
}

impl SlurmQuotaBackend {
    /// Create a backend with no scopes.
    #[must_use]
    pub fn new(client: SlurmClient) -> Self {
        Self {
            client,
            partitions: HashMap::new(),
        }
    }

    /// Map a scope to a partition.
    #[must_use]
    pub fn with_scope(mut self, scope: ClusterId, partition: impl Into<String>) -> Self {
        self.partitions.insert(scope, partition.into());
        self
    }
}

impl QuotaBackend for SlurmQuotaBackend {
    fn kind(&self) -> &'static str {
        "slurm"
    }

    fn scopes(&self) -> Vec<ClusterId> {
        self.partitions.keys().cloned().collect()
    }

    fn fetch<'a>(
        &'a self,
        scope: &'a ClusterId,
    ) -> Pin<Box<dyn Future<Output = Result<BackendUsage>> + Send + 'a>> {
        Box::pin(async move {
            let partition = self
                .partitions
                .get(scope)
                .ok_or_else(|| QuotaError::UnknownScope(scope.clone()))?;
            let nodes = self
                .client
                .list_nodes()
                .await
                .map_err(|e| QuotaError::BackendUnavailable {
                    scope: scope.clone(),
                    reason: e.to_string(),
                })?;
            partition_usage(partition, &nodes)
        })
    }
}

/// Sum capacity and allocation over the available nodes of a partition.
///
/// Slurm reports memory in megabytes of 1024 KiB, i.e. MiB.
///
/// # Errors
///
/// `InvalidQuota` if no node belongs to the partition.
pub fn partition_usage(partition: &str, nodes: &[SlurmNode]) -> Result<BackendUsage> {
    let members: Vec<&SlurmNode> = nodes.iter().filter(|n| n.in_partition(partition)).collect();
    if members.is_empty() {
        return Err(QuotaError::InvalidQuota(format!(
            "partition {partition} has no nodes"
        )));
    }

    let mut limits = ResourceVector::ZERO;
    let mut used = ResourceVector::ZERO;
    for node in members.into_iter().filter(|n| n.is_available()) {
        limits += ResourceVector::ZERO
            .with_cpu(f64::from(node.cpus))
            .with_memory(node.real_memory as f64)
            .with_gpu(node.gpus_total());
        used += ResourceVector::ZERO
            .with_cpu(f64::from(node.alloc_cpus))
            .with_memory(node.alloc_memory as f64)
            .with_gpu(node.gpus_used());
    }
    Ok(BackendUsage { limits, used })
}
