//! `slurmrestd` client.
//!
//! Requests are authenticated with the `X-SLURM-USER-NAME` and
//! `X-SLURM-USER-TOKEN` headers (JWT auth). Paths are versioned as
//! `/slurm/{api_version}/...`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{BackendError, Result};
use crate::http::{send_empty, send_json};

/// API version used when none is configured.
pub const DEFAULT_API_VERSION: &str = "v0.0.40";

/// Node states that contribute no schedulable capacity.
const UNAVAILABLE_NODE_STATES: [&str; 6] = [
    "DOWN",
    "DRAIN",
    "DRAINED",
    "DRAINING",
    "FAIL",
    "NOT_RESPONDING",
];

/// Where and as whom to reach `slurmrestd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlurmConnection {
    /// Base URL, e.g. `http://slurm:6820`.
    pub url: Url,
    /// REST API version segment.
    pub api_version: String,
    /// Value of `X-SLURM-USER-NAME`.
    pub user: String,
    /// Value of `X-SLURM-USER-TOKEN`.
    pub token: Option<String>,
}

impl SlurmConnection {
    /// Create a connection using [`DEFAULT_API_VERSION`].
    #[must_use]
    pub fn new(url: Url, user: impl Into<String>) -> Self {
        Self {
            url,
            api_version: DEFAULT_API_VERSION.to_string(),
            user: user.into(),
            token: None,
        }
    }

    /// Set the JWT.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the API version.
    #[must_use]
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }
}

/// A job or node state, which newer API versions send as a flag list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlurmState {
    /// Single state string (older API versions).
    One(String),
    /// State flags (`["RUNNING"]`, `["IDLE", "DRAIN"]`).
    Many(Vec<String>),
}

impl Default for SlurmState {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl SlurmState {
    /// All flags, upper-cased.
    #[must_use]
    pub fn flags(&self) -> Vec<String> {
        match self {
            Self::One(s) => s
                .split(['+', ','])
                .filter(|f| !f.is_empty())
                .map(str::to_ascii_uppercase)
                .collect(),
            Self::Many(v) => v.iter().map(|s| s.to_ascii_uppercase()).collect(),
        }
    }

    /// Check if any flag equals `flag` (case-insensitive).
    #[must_use]
    pub fn contains(&self, flag: &str) -> bool {
        self.flags().iter().any(|f| f.eq_ignore_ascii_case(flag))
    }
}

/// An error or warning entry from a `slurmrestd` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SlurmMessage {
    /// Short error text.
    #[serde(default)]
    pub error: Option<String>,
    /// Longer description.
    #[serde(default)]
    pub description: Option<String>,
}

impl SlurmMessage {
    fn text(&self) -> String {
        match (&self.error, &self.description) {
            (Some(e), Some(d)) => format!("{e}: {d}"),
            (Some(t), None) | (None, Some(t)) => t.clone(),
            (None, None) => "unknown slurm error".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    job_id: Option<u64>,
    #[serde(default)]
    errors: Vec<SlurmMessage>,
}

#[derive(Debug, Deserialize)]
struct JobsResponse {
    #[serde(default)]
    jobs: Vec<SlurmJob>,
}

#[derive(Debug, Deserialize)]
struct NodesResponse {
    #[serde(default)]
    nodes: Vec<SlurmNode>,
}

/// A job record from `GET /job/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SlurmJob {
    /// Slurm job number.
    pub job_id: u64,
    /// Job name given at submission.
    #[serde(default)]
    pub name: Option<String>,
    /// Current state flags.
    #[serde(default)]
    pub job_state: SlurmState,
    /// Why the job is in its state.
    #[serde(default)]
    pub state_reason: Option<String>,
}

fn jobs_named(jobs: Vec<SlurmJob>, name: &str) -> Vec<SlurmJob> {
    jobs.into_iter()
        .filter(|job| job.name.as_deref() == Some(name))
        .collect()
}

/// A node record from `GET /nodes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SlurmNode {
    /// Node name.
    #[serde(default)]
    pub name: String,
    /// Configured CPUs.
    #[serde(default)]
    pub cpus: u32,
    /// Allocated CPUs.
    #[serde(default)]
    pub alloc_cpus: u32,
    /// Configured memory in MB.
    #[serde(default)]
    pub real_memory: u64,
    /// Allocated memory in MB.
    #[serde(default)]
    pub alloc_memory: u64,
    /// Configured generic resources (`gpu:a100:4`).
    #[serde(default)]
    pub gres: String,
    /// Allocated generic resources (`gpu:a100:2(IDX:0-1)`).
    #[serde(default)]
    pub gres_used: String,
    /// Partitions the node belongs to.
    #[serde(default)]
    pub partitions: Vec<String>,
    /// State flags.
    #[serde(default)]
    pub state: SlurmState,
}

impl SlurmNode {
    /// Configured GPUs.
    #[must_use]
    pub fn gpus_total(&self) -> u32 {
        count_gpus(&self.gres)
    }

    /// Allocated GPUs.
    #[must_use]
    pub fn gpus_used(&self) -> u32 {
        count_gpus(&self.gres_used)
    }

    /// Check if the node can take work.
    #[must_use]
    pub fn is_available(&self) -> bool {
        let flags = self.state.flags();
        !flags
            .iter()
            .any(|f| UNAVAILABLE_NODE_STATES.contains(&f.as_str()))
    }

    /// Check if the node belongs to `partition`.
    #[must_use]
    pub fn in_partition(&self, partition: &str) -> bool {
        self.partitions.iter().any(|p| p == partition)
    }
}

/// Sum the GPU counts of a GRES string such as `gpu:a100:4,gpu:v100:2(S:0-1)`.
///
/// An entry without a count (`gpu:a100`) counts as one device.
#[must_use]
pub fn count_gpus(gres: &str) -> u32 {
    let mut flat = String::with_capacity(gres.len());
    let mut depth = 0_u32;
    for c in gres.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => flat.push(c),
            _ => {}
        }
    }

    flat.split(',')
        .map(str::trim)
        .filter(|entry| entry.split(':').next() == Some("gpu"))
        .map(|entry| {
            let mut parts = entry.split(':').skip(1).collect::<Vec<_>>();
            match parts.pop() {
                Some(last) => last.parse::<u32>().unwrap_or(1),
                None => 1,
            }
        })
        .sum()
}

/// Client for one `slurmrestd` endpoint.
#[derive(Debug, Clone)]
pub struct SlurmClient {
    http: reqwest::Client,
    connection: SlurmConnection,
}

impl SlurmClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] if the user name is empty or the
    /// HTTP client cannot be built.
    pub fn new(connection: SlurmConnection, timeout: Duration) -> Result<Self> {
        if connection.user.trim().is_empty() {
            return Err(BackendError::Config("slurm user name cannot be empty".to_string()));
        }
        if connection.api_version.trim().is_empty() {
            return Err(BackendError::Config("slurm API version cannot be empty".to_string()));
        }
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, connection })
    }

    /// Connection settings.
    #[must_use]
    pub const fn connection(&self) -> &SlurmConnection {
        &self.connection
    }

    /// Absolute URL of a versioned API path (`job/submit`, `nodes`, ...).
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] if the result is not a valid URL.
    pub fn url(&self, path: &str) -> Result<Url> {
        let joined = format!(
            "{}/slurm/{}/{}",
            self.connection.url.as_str().trim_end_matches('/'),
            self.connection.api_version,
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| BackendError::Config(format!("invalid URL '{joined}': {e}")))
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let request = self
            .http
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json")
            .header("X-SLURM-USER-NAME", &self.connection.user);
        match &self.connection.token {
            Some(token) => request.header("X-SLURM-USER-TOKEN", token),
            None => request,
        }
    }

    /// Submit a batch job; `body` is the `{"script": .., "job": {..}}` document.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, non-success status, or if the
    /// response carries errors instead of a job number.
    pub async fn submit_job(&self, body: &serde_json::Value) -> Result<u64> {
        let url = self.url("job/submit")?;
        let label = url.to_string();
        let response: SubmitResponse =
            send_json(self.request(reqwest::Method::POST, url).json(body), &label).await?;

        match (response.job_id, response.errors.first()) {
            (Some(job_id), None) => Ok(job_id),
            (_, Some(message)) => Err(BackendError::Status {
                url: label,
                status: 200,
                body: message.text(),
            }),
            (None, None) => Err(BackendError::Decode {
                url: label,
                reason: "response has neither job_id nor errors".to_string(),
            }),
        }
    }

    /// Fetch a job by number.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or non-success status; a job
    /// the controller has forgotten decodes to a `404`-style
    /// [`BackendError::Status`].
    pub async fn get_job(&self, job_id: &str) -> Result<SlurmJob> {
        let url = self.url(&format!("job/{job_id}"))?;
        let label = url.to_string();
        let response: JobsResponse =
            send_json(self.request(reqwest::Method::GET, url), &label).await?;
        response.jobs.into_iter().next().ok_or(BackendError::Status {
            url: label,
            status: 404,
            body: format!("job {job_id} not found"),
        })
    }

    /// List the jobs the controller knows that carry `name`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or non-success status.
    pub async fn find_jobs_by_name(&self, name: &str) -> Result<Vec<SlurmJob>> {
        let url = self.url("jobs")?;
        let label = url.to_string();
        let response: JobsResponse =
            send_json(self.request(reqwest::Method::GET, url), &label).await?;
        Ok(jobs_named(response.jobs, name))
    }

    /// Cancel a job.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or non-success status.
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let url = self.url(&format!("job/{job_id}"))?;
        let label = url.to_string();
        send_empty(self.request(reqwest::Method::DELETE, url), &label).await
    }

    /// List all nodes.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or non-success status.
    pub async fn list_nodes(&self) -> Result<Vec<SlurmNode>> {
        let url = self.url("nodes")?;
        let label = url.to_string();
        let response: NodesResponse =
            send_json(self.request(reqwest::Method::GET, url), &label).await?;
        Ok(response.nodes)
    }
}
