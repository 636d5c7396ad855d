//! Kubernetes executor: one `batch/v1` Job per dispatch attempt.

use std::future::Future;
use std::pin::Pin;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use vdc_backend::{KubeClient, KubeJob};
use vdc_proto::{ExecutorHandle, ExecutorStatus, ExecutorType, ResourceVector};

use crate::error::{ExecutorError, Result};
use crate::executor::{Executor, JobSubmission};

/// Label carrying the (sanitised) VDC job ID.
pub const JOB_ID_LABEL: &str = "vdc.io/job-id";
/// Annotation carrying the raw VDC job ID.
pub const JOB_ID_ANNOTATION: &str = "vdc.io/job-id";
/// Extended resource name for NVIDIA GPUs.
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Executor creating Kubernetes Jobs.
#[derive(Debug, Clone)]
pub struct KubernetesExecutor {
    client: KubeClient,
    namespace: String,
    image_pull_policy: Option<String>,
}

impl KubernetesExecutor {
    /// Create an executor for a namespace.
    #[must_use]
    pub fn new(client: KubeClient, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            image_pull_policy: None,
        }
    }

    /// Set the container image pull policy.
    #[must_use]
    pub fn with_image_pull_policy(mut self, policy: impl Into<String>) -> Self {
        self.image_pull_policy = Some(policy.into());
        self
    }

    /// Namespace jobs are created in.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn namespace_of<'h>(&'h self, handle: &'h ExecutorHandle) -> &'h str {
        handle.location.as_deref().unwrap_or(&self.namespace)
    }
}

/// Render the Job manifest for a submission.
///
/// # Errors
///
/// `SubmitFailed` if the payload has no image.
pub fn job_manifest(
    submission: &JobSubmission,
    namespace: &str,
    image_pull_policy: Option<&str>,
) -> Result<Value> {
    let image = submission
        .payload
        .image
        .as_deref()
        .ok_or_else(|| ExecutorError::SubmitFailed {
            job_id: submission.job_id.to_string(),
            reason: "kubernetes jobs need a container image".to_string(),
        })?;

    let name = submission.external_name();
    let mut container = Map::new();
    container.insert("name".to_string(), json!("job"));
    container.insert("image".to_string(), json!(image));
    if let Some((command, args)) = submission.payload.command.split_first() {
        container.insert("command".to_string(), json!([command]));
        if !args.is_empty() {
            container.insert("args".to_string(), json!(args));
        }
    }
    if !submission.payload.env.is_empty() {
        let env: Vec<Value> = submission
            .payload
            .env
            .iter()
            .map(|(k, v)| json!({"name": k, "value": v}))
            .collect();
        container.insert("env".to_string(), Value::Array(env));
    }
    if let Some(dir) = &submission.payload.working_dir {
        container.insert("workingDir".to_string(), json!(dir));
    }
    if let Some(policy) = image_pull_policy {
        container.insert("imagePullPolicy".to_string(), json!(policy));
    }
    let resources = resource_map(&submission.resources);
    if !resources.is_empty() {
        container.insert(
            "resources".to_string(),
            json!({"requests": resources, "limits": resources}),
        );
    }

    Ok(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": {
                JOB_ID_LABEL: label_value(submission.job_id.as_str()),
                "app.kubernetes.io/managed-by": "vdc-scheduler",
            },
            "annotations": {
                JOB_ID_ANNOTATION: submission.job_id.as_str(),
                "vdc.io/attempt": submission.attempt.to_string(),
            },
        },
        "spec": {
            "backoffLimit": 0,
            "template": {
                "metadata": {
                    "labels": { JOB_ID_LABEL: label_value(submission.job_id.as_str()) },
                },
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [Value::Object(container)],
                },
            },
        },
    }))
}

fn resource_map(resources: &ResourceVector) -> Map<String, Value> {
    let mut map = Map::new();
    if resources.cpu > 0.0 {
        let millis = (resources.cpu * 1000.0).ceil() as u64;
        map.insert("cpu".to_string(), json!(format!("{millis}m")));
    }
    if resources.memory > 0.0 {
        let mib = resources.memory.ceil() as u64;
        map.insert("memory".to_string(), json!(format!("{mib}Mi")));
    }
    if resources.gpu > 0 {
        map.insert(GPU_RESOURCE.to_string(), json!(resources.gpu.to_string()));
    }
    map
}

/// Label values: at most 63 characters of `[A-Za-z0-9._-]`, alphanumeric at
/// both ends.
fn label_value(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(63)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Map a Job's status block to an [`ExecutorStatus`].
#[must_use]
pub fn status_from_job(job: &KubeJob) -> ExecutorStatus {
    let Some(status) = &job.status else {
        return ExecutorStatus::Running;
    };

    if status.conditions.iter().any(|c| c.is_true("Complete")) {
        return ExecutorStatus::Succeeded;
    }
    if let Some(condition) = status.conditions.iter().find(|c| c.is_true("Failed")) {
        let reason = condition
            .message
            .clone()
            .or_else(|| condition.reason.clone())
            .unwrap_or_else(|| "job failed".to_string());
        return ExecutorStatus::Failed(reason);
    }
    if status.succeeded.unwrap_or(0) > 0 {
        return ExecutorStatus::Succeeded;
    }
    if status.failed.unwrap_or(0) > 0 && status.active.unwrap_or(0) == 0 {
        return ExecutorStatus::Failed("pod failed".to_string());
    }
    ExecutorStatus::Running
}

impl Executor for KubernetesExecutor {
    fn executor_type(&self) -> ExecutorType {
        ExecutorType::Kubernetes
    }

    fn submit<'a>(
        &'a self,
        submission: &'a JobSubmission,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorHandle>> + Send + 'a>> {
        Box::pin(async move {
            let manifest = job_manifest(
                submission,
                &self.namespace,
                self.image_pull_policy.as_deref(),
            )?;
            let created = self
                .client
                .create_job(&self.namespace, &manifest)
                .await
                .map_err(|e| ExecutorError::SubmitFailed {
                    job_id: submission.job_id.to_string(),
                    reason: e.to_string(),
                })?;

            let name = created
                .metadata
                .name
                .unwrap_or_else(|| submission.external_name());
            info!(
                job_id = %submission.job_id,
                namespace = %self.namespace,
                name = %name,
                "created kubernetes job"
            );
            Ok(ExecutorHandle::new(ExecutorType::Kubernetes, name).with_location(&self.namespace))
        })
    }

    fn get_status<'a>(
        &'a self,
        handle: &'a ExecutorHandle,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorStatus>> + Send + 'a>> {
        Box::pin(async move {
            match self
                .client
                .get_job(self.namespace_of(handle), &handle.external_id)
                .await
            {
                Ok(job) => Ok(status_from_job(&job)),
                Err(e) if e.is_not_found() => {
                    warn!(handle = %handle, "kubernetes job disappeared");
                    Ok(ExecutorStatus::Failed("job no longer exists".to_string()))
                }
                Err(e) => Err(ExecutorError::StatusFailed {
                    handle: handle.to_string(),
                    reason: e.to_string(),
                }),
            }
        })
    }

    fn cancel<'a>(
        &'a self,
        handle: &'a ExecutorHandle,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            match self
                .client
                .delete_job(self.namespace_of(handle), &handle.external_id)
                .await
            {
                Ok(()) => {
                    info!(handle = %handle, "deleted kubernetes job");
                    Ok(())
                }
                Err(e) if e.is_not_found() => {
                    debug!(handle = %handle, "kubernetes job already gone");
                    Ok(())
                }
                Err(e) => Err(ExecutorError::CancelFailed {
                    handle: handle.to_string(),
                    reason: e.to_string(),
                }),
            }
        })
    }
}
