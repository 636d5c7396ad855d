//! Kubernetes API client.
//!
//! A thin JSON client over the API server's REST interface covering the two
//! resources the scheduler touches: `ResourceQuota` (capacity) and
//! `batch/v1` `Job` (execution).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{BackendError, Result};
use crate::http::{send_empty, send_json};
use crate::kubeconfig::{ClusterConnection, Kubeconfig};

/// Object metadata shared by every Kubernetes resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Object namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Server-assigned UID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// A `v1` `ResourceQuota`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResourceQuota {
    /// Metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Observed hard limits and usage.
    #[serde(default)]
    pub status: Option<ResourceQuotaStatus>,
}

/// Status block of a `ResourceQuota`; values are quantity strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResourceQuotaStatus {
    /// Enforced limits keyed by resource name (`requests.cpu`, ...).
    #[serde(default)]
    pub hard: BTreeMap<String, String>,
    /// Current usage keyed by resource name.
    #[serde(default)]
    pub used: BTreeMap<String, String>,
}

/// A `batch/v1` `Job` as returned by the API server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KubeJob {
    /// Metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Observed status.
    #[serde(default)]
    pub status: Option<KubeJobStatus>,
}

/// Status block of a `Job`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KubeJobStatus {
    /// Pods currently running.
    #[serde(default)]
    pub active: Option<u32>,
    /// Pods that succeeded.
    #[serde(default)]
    pub succeeded: Option<u32>,
    /// Pods that failed.
    #[serde(default)]
    pub failed: Option<u32>,
    /// Latest observations.
    #[serde(default)]
    pub conditions: Vec<JobCondition>,
}

/// One `Job` condition (`Complete`, `Failed`, `Suspended`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JobCondition {
    /// Condition type.
    #[serde(rename = "type")]
    pub kind: String,
    /// `True`, `False` or `Unknown`.
    pub status: String,
    /// Machine-readable reason.
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message.
    #[serde(default)]
    pub message: Option<String>,
}

impl JobCondition {
    /// Check if the condition is of `kind` and currently true.
    #[must_use]
    pub fn is_true(&self, kind: &str) -> bool {
        self.kind == kind && self.status.eq_ignore_ascii_case("true")
    }
}

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// Client for one Kubernetes API server.
#[derive(Debug, Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    server: Url,
    token: Option<String>,
    default_namespace: Option<String>,
}

impl KubeClient {
    /// Create a client for a resolved connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(connection: &ClusterConnection, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: connection.http_client(timeout)?,
            server: connection.server.clone(),
            token: connection.token.clone(),
            default_namespace: connection.namespace.clone(),
        })
    }

    /// Create a client from a kubeconfig file.
    ///
    /// # Errors
    ///
    /// Returns an error if the kubeconfig cannot be loaded or resolved.
    pub fn from_kubeconfig(
        path: impl AsRef<Path>,
        context: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let connection = Kubeconfig::from_file(path)?.resolve(context)?;
        tracing::debug!(server = %connection.server, "kubernetes client configured");
        Self::new(&connection, timeout)
    }

    /// Namespace of the kubeconfig context, if any.
    #[must_use]
    pub fn default_namespace(&self) -> Option<&str> {
        self.default_namespace.as_deref()
    }

    /// API server base URL.
    #[must_use]
    pub const fn server(&self) -> &Url {
        &self.server
    }

    /// Absolute URL of an API path, keeping any path prefix of the server.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] if the result is not a valid URL.
    pub fn url(&self, path: &str) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.server.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| BackendError::Config(format!("invalid URL '{joined}': {e}")))
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let request = self
            .http
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// `GET` a path and decode the JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, non-success status or a body
    /// that does not decode as `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path)?;
        let label = url.to_string();
        send_json(self.request(reqwest::Method::GET, url), &label).await
    }

    /// `POST` a JSON body and decode the JSON response.
    ///
    /// # Errors
    ///
    /// Same as [`KubeClient::get_json`].
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = self.url(path)?;
        let label = url.to_string();
        send_json(self.request(reqwest::Method::POST, url).json(body), &label).await
    }

    /// `DELETE` a path, optionally with `DeleteOptions`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or non-success status.
    pub async fn delete(&self, path: &str, options: Option<&serde_json::Value>) -> Result<()> {
        let url = self.url(path)?;
        let label = url.to_string();
        let mut request = self.request(reqwest::Method::DELETE, url);
        if let Some(options) = options {
            request = request.json(options);
        }
        send_empty(request, &label).await
    }

    /// List the `ResourceQuota` objects of a namespace.
    ///
    /// # Errors
    ///
    /// Same as [`KubeClient::get_json`].
    pub async fn list_resource_quotas(&self, namespace: &str) -> Result<Vec<ResourceQuota>> {
        let list: ObjectList<ResourceQuota> = self
            .get_json(&format!("/api/v1/namespaces/{namespace}/resourcequotas"))
            .await?;
        Ok(list.items)
    }

    /// Create a `batch/v1` Job from a manifest.
    ///
    /// # Errors
    ///
    /// Same as [`KubeClient::get_json`]; a name clash is a `409` status.
    pub async fn create_job(&self, namespace: &str, manifest: &serde_json::Value) -> Result<KubeJob> {
        self.post_json(&format!("/apis/batch/v1/namespaces/{namespace}/jobs"), manifest)
            .await
    }

    /// Fetch a `batch/v1` Job.
    ///
    /// # Errors
    ///
    /// Same as [`KubeClient::get_json`].
    pub async fn get_job(&self, namespace: &str, name: &str) -> Result<KubeJob> {
        self.get_json(&format!("/apis/batch/v1/namespaces/{namespace}/jobs/{name}"))
            .await
    }

    /// Delete a `batch/v1` Job and, in the background, its pods.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or non-success status.
    pub async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let options = serde_json::json!({
            "kind": "DeleteOptions",
            "apiVersion": "v1",
            "propagationPolicy": "Background",
        });
        self.delete(
            &format!("/apis/batch/v1/namespaces/{namespace}/jobs/{name}"),
            Some(&options),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(server: &str) -> KubeClient {
        let url = Url::parse(server).unwrap_or_else(|_| unreachable!());
        KubeClient::new(&ClusterConnection::plain(url), Duration::from_secs(5))
            .unwrap_or_else(|_| unreachable!())
    }

    // ==================== URLs ====================

    #[test]
    fn test_url_joins_api_path() {
        let url = client("https://10.0.0.1:6443").url("/api/v1/namespaces");
        assert_eq!(
            url.map(|u| u.to_string()).ok().as_deref(),
            Some("https://10.0.0.1:6443/api/v1/namespaces")
        );
    }

    #[test]
    fn test_url_keeps_server_prefix() {
        let url = client("https://rancher.local/k8s/clusters/c-1/").url("/apis/batch/v1");
        assert_eq!(
            url.map(|u| u.to_string()).ok().as_deref(),
            Some("https://rancher.local/k8s/clusters/c-1/apis/batch/v1")
        );
    }

    // ==================== Models ====================

    #[test]
    fn test_decode_resource_quota_list() {
        let json = r#"{
            "kind": "ResourceQuotaList",
            "items": [{
                "metadata": {"name": "gpu-quota", "namespace": "ml-jobs"},
                "status": {
                    "hard": {"requests.cpu": "64", "requests.nvidia.com/gpu": "8"},
                    "used": {"requests.cpu": "12500m", "requests.nvidia.com/gpu": "3"}
                }
            }]
        }"#;
        let list: ObjectList<ResourceQuota> =
            serde_json::from_str(json).unwrap_or_else(|_| unreachable!());
        assert_eq!(list.items.len(), 1);
        let status = list.items[0].status.clone().unwrap_or_default();
        assert_eq!(status.hard.get("requests.cpu").map(String::as_str), Some("64"));
        assert_eq!(status.used.get("requests.nvidia.com/gpu").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_decode_empty_list() {
        let list: ObjectList<ResourceQuota> =
            serde_json::from_str(r#"{"kind": "ResourceQuotaList"}"#).unwrap_or_else(|_| unreachable!());
        assert!(list.items.is_empty());
    }

    #[test]
    fn test_decode_job_status() {
        let json = r#"{
            "metadata": {"name": "vdc-train", "uid": "abc"},
            "status": {
                "failed": 1,
                "conditions": [{"type": "Failed", "status": "True", "reason": "BackoffLimitExceeded"}]
            }
        }"#;
        let job: KubeJob = serde_json::from_str(json).unwrap_or_else(|_| unreachable!());
        let status = job.status.unwrap_or_default();
        assert_eq!(status.failed, Some(1));
        assert!(status.conditions[0].is_true("Failed"));
        assert!(!status.conditions[0].is_true("Complete"));
    }
}
