//! Minimal kubeconfig loading.
//!
//! Only the fields needed to reach an API server are read: server URL,
//! certificate authority, bearer token (inline or file), client certificate
//! and the context namespace. Exec and auth-provider plugins are not
//! supported.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use url::Url;

use crate::error::{BackendError, Result};

/// A parsed kubeconfig file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// Known clusters.
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    /// Known contexts.
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    /// Known users.
    #[serde(default)]
    pub users: Vec<NamedUser>,
    /// Context used when none is requested.
    pub current_context: Option<String>,
    /// Directory relative file references are resolved against.
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

/// A `clusters[]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NamedCluster {
    /// Entry name.
    pub name: String,
    /// Connection details.
    pub cluster: ClusterEntry,
}

/// Connection details of a cluster.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    /// API server URL.
    pub server: String,
    /// Path to a PEM CA bundle.
    pub certificate_authority: Option<PathBuf>,
    /// Base64 PEM CA bundle.
    pub certificate_authority_data: Option<String>,
    /// Skip server certificate verification.
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

/// A `contexts[]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NamedContext {
    /// Entry name.
    pub name: String,
    /// Cluster/user pairing.
    pub context: ContextEntry,
}

/// Cluster/user pairing of a context.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextEntry {
    /// Cluster entry name.
    pub cluster: String,
    /// User entry name.
    pub user: Option<String>,
    /// Default namespace.
    pub namespace: Option<String>,
}

/// A `users[]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NamedUser {
    /// Entry name.
    pub name: String,
    /// Credentials.
    #[serde(default)]
    pub user: UserEntry,
}

/// Credentials of a user entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    /// Bearer token.
    pub token: Option<String>,
    /// File holding a bearer token.
    #[serde(rename = "tokenFile")]
    pub token_file: Option<PathBuf>,
    /// Path to a PEM client certificate.
    pub client_certificate: Option<PathBuf>,
    /// Base64 PEM client certificate.
    pub client_certificate_data: Option<String>,
    /// Path to a PEM client key.
    pub client_key: Option<PathBuf>,
    /// Base64 PEM client key.
    pub client_key_data: Option<String>,
}

/// Everything needed to open connections to one API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConnection {
    /// API server base URL.
    pub server: Url,
    /// Namespace of the selected context.
    pub namespace: Option<String>,
    /// PEM CA bundle.
    pub ca_pem: Option<Vec<u8>>,
    /// Skip server certificate verification.
    pub insecure: bool,
    /// Bearer token.
    pub token: Option<String>,
    /// PEM client certificate followed by its key.
    pub identity_pem: Option<Vec<u8>>,
}

impl Kubeconfig {
    /// Load a kubeconfig file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackendError::Kubeconfig(format!("failed to read '{}': {e}", path.display()))
        })?;
        let mut config = Self::from_yaml(&content)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    /// Parse kubeconfig YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| BackendError::Kubeconfig(format!("invalid kubeconfig YAML: {e}")))
    }

    /// Resolve a context (or the current context) to connection details.
    ///
    /// # Errors
    ///
    /// Returns an error if the context, its cluster or its user is missing,
    /// or if a referenced credential cannot be read or decoded.
    pub fn resolve(&self, context: Option<&str>) -> Result<ClusterConnection> {
        let context_name = context
            .or(self.current_context.as_deref())
            .ok_or_else(|| BackendError::Kubeconfig("no context selected".to_string()))?;

        let context = self
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.context)
            .ok_or_else(|| {
                BackendError::Kubeconfig(format!("context '{context_name}' not found"))
            })?;

        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| {
                BackendError::Kubeconfig(format!("cluster '{}' not found", context.cluster))
            })?;

        let user = match &context.user {
            Some(name) => Some(
                self.users
                    .iter()
                    .find(|u| &u.name == name)
                    .map(|u| &u.user)
                    .ok_or_else(|| BackendError::Kubeconfig(format!("user '{name}' not found")))?,
            ),
            None => None,
        };

        let server = Url::parse(&cluster.server).map_err(|e| {
            BackendError::Kubeconfig(format!("invalid server URL '{}': {e}", cluster.server))
        })?;

        let ca_pem = self.load_pem(
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
        )?;

        let (token, identity_pem) = match user {
            Some(user) => (self.load_token(user)?, self.load_identity(user)?),
            None => (None, None),
        };

        Ok(ClusterConnection {
            server,
            namespace: context.namespace.clone(),
            ca_pem,
            insecure: cluster.insecure_skip_tls_verify,
            token,
            identity_pem,
        })
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn load_pem(&self, data: Option<&str>, file: Option<&Path>) -> Result<Option<Vec<u8>>> {
        if let Some(data) = data {
            return STANDARD
                .decode(data.trim())
                .map(Some)
                .map_err(|e| BackendError::Kubeconfig(format!("invalid base64 data: {e}")));
        }
        match file {
            Some(path) => {
                let path = self.resolve_path(path);
                std::fs::read(&path).map(Some).map_err(|e| {
                    BackendError::Kubeconfig(format!("failed to read '{}': {e}", path.display()))
                })
            }
            None => Ok(None),
        }
    }

    fn load_token(&self, user: &UserEntry) -> Result<Option<String>> {
        if let Some(token) = &user.token {
            return Ok(Some(token.trim().to_string()));
        }
        match &user.token_file {
            Some(path) => {
                let path = self.resolve_path(path);
                std::fs::read_to_string(&path)
                    .map(|t| Some(t.trim().to_string()))
                    .map_err(|e| {
                        BackendError::Kubeconfig(format!(
                            "failed to read token file '{}': {e}",
                            path.display()
                        ))
                    })
            }
            None => Ok(None),
        }
    }

    fn load_identity(&self, user: &UserEntry) -> Result<Option<Vec<u8>>> {
        let cert = self.load_pem(
            user.client_certificate_data.as_deref(),
            user.client_certificate.as_deref(),
        )?;
        let key = self.load_pem(user.client_key_data.as_deref(), user.client_key.as_deref())?;
        match (cert, key) {
            (Some(mut cert), Some(key)) => {
                if !cert.ends_with(b"\n") {
                    cert.push(b'\n');
                }
                cert.extend_from_slice(&key);
                Ok(Some(cert))
            }
            (None, None) => Ok(None),
            _ => Err(BackendError::Kubeconfig(
                "client certificate and key must be given together".to_string(),
            )),
        }
    }
}

impl ClusterConnection {
    /// Connection to a plain URL with no credentials.
    #[must_use]
    pub const fn plain(server: Url) -> Self {
        Self {
            server,
            namespace: None,
            ca_pem: None,
            insecure: false,
            token: None,
            identity_pem: None,
        }
    }

    /// Build an HTTP client trusting this connection's CA and presenting its
    /// client certificate.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] if a certificate cannot be loaded.
    pub fn http_client(&self, timeout: Duration) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().use_rustls_tls().timeout(timeout);

        if let Some(ca) = &self.ca_pem {
            let certificate = reqwest::Certificate::from_pem(ca)
                .map_err(|e| BackendError::Config(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(certificate);
        }
        if let Some(pem) = &self.identity_pem {
            let identity = reqwest::Identity::from_pem(pem)
                .map_err(|e| BackendError::Config(format!("invalid client identity: {e}")))?;
            builder = builder.identity(identity);
        }
        if self.insecure {
            tracing::warn!(server = %self.server, "TLS verification disabled by kubeconfig");
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder
            .build()
            .map_err(|e| BackendError::Config(format!("failed to build HTTP client: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"
apiVersion: v1
kind: Config
current-context: prod
clusters:
  - name: gpu-east
    cluster:
      server: https://10.0.0.1:6443
      certificate-authority-data: Y2EtYnVuZGxl
  - name: lab
    cluster:
      server: https://lab.internal:6443
      insecure-skip-tls-verify: true
contexts:
  - name: prod
    context:
      cluster: gpu-east
      user: scheduler
      namespace: ml-jobs
  - name: lab
    context:
      cluster: lab
users:
  - name: scheduler
    user:
      token: sekrit
";

    fn sample() -> Kubeconfig {
        Kubeconfig::from_yaml(SAMPLE).unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn test_resolve_current_context() {
        let conn = sample().resolve(None).unwrap_or_else(|_| unreachable!());
        assert_eq!(conn.server.as_str(), "https://10.0.0.1:6443/");
        assert_eq!(conn.namespace.as_deref(), Some("ml-jobs"));
        assert_eq!(conn.token.as_deref(), Some("sekrit"));
        assert_eq!(conn.ca_pem.as_deref(), Some(b"ca-bundle".as_slice()));
        assert!(!conn.insecure);
    }

    #[test]
    fn test_resolve_named_context_without_user() {
        let conn = sample().resolve(Some("lab")).unwrap_or_else(|_| unreachable!());
        assert!(conn.insecure);
        assert!(conn.token.is_none());
        assert!(conn.namespace.is_none());
    }

    #[test]
    fn test_resolve_missing_context() {
        let err = sample().resolve(Some("staging"));
        assert!(matches!(err, Err(BackendError::Kubeconfig(msg)) if msg.contains("staging")));
    }

    #[test]
    fn test_resolve_without_current_context() {
        let config = Kubeconfig::default();
        assert!(config.resolve(None).is_err());
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(Kubeconfig::from_yaml("clusters: [").is_err());
    }

    #[test]
    fn test_token_file_relative_to_kubeconfig() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        std::fs::write(dir.path().join("token"), "file-token\n").unwrap_or_else(|_| unreachable!());
        let yaml = r"
current-context: c
clusters:
  - name: k
    cluster:
      server: http://127.0.0.1:8080
contexts:
  - name: c
    context:
      cluster: k
      user: u
users:
  - name: u
    user:
      tokenFile: token
";
        let path = dir.path().join("config");
        std::fs::write(&path, yaml).unwrap_or_else(|_| unreachable!());

        let config = Kubeconfig::from_file(&path).unwrap_or_else(|_| unreachable!());
        let conn = config.resolve(None).unwrap_or_else(|_| unreachable!());
        assert_eq!(conn.token.as_deref(), Some("file-token"));
    }

    #[test]
    fn test_client_cert_without_key_rejected() {
        let yaml = r"
current-context: c
clusters:
  - name: k
    cluster:
      server: https://k:6443
contexts:
  - name: c
    context:
      cluster: k
      user: u
users:
  - name: u
    user:
      client-certificate-data: Y2VydA==
";
        let config = Kubeconfig::from_yaml(yaml).unwrap_or_else(|_| unreachable!());
        assert!(config.resolve(None).is_err());
    }

    #[test]
    fn test_plain_connection_builds_client() {
        let url = Url::parse("http://127.0.0.1:6820").unwrap_or_else(|_| unreachable!());
        let conn = ClusterConnection::plain(url);
        assert!(conn.http_client(Duration::from_secs(5)).is_ok());
    }
}
