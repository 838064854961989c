//! Cluster connection and dialer configuration

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::client::ssl::TlsSettings;
use crate::errors::PodtunnelError;
use super::kubeconfig::Kubeconfig;

/// Service account mount used when running inside a pod
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Default user agent sent on the upgrade request
pub const USER_AGENT_STRING: &str = concat!("podtunnel/", env!("CARGO_PKG_VERSION"));

/// Where and how to reach the cluster API server
#[derive(Clone)]
pub struct ClusterConfig {
    /// API server base URL, e.g. `https://10.0.0.1:6443`
    pub server: Url,
    /// Bearer token
    pub token: Option<String>,
    /// Basic auth username
    pub username: Option<String>,
    /// Basic auth password
    pub password: Option<String>,
    pub tls: TlsSettings,
    /// Explicit HTTP proxy for the API server; environment proxies are ignored
    pub proxy_url: Option<Url>,
    /// Namespace of the selected context, if any
    pub namespace: Option<String>,
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("server", &self.server.as_str())
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("tls", &self.tls)
            .field("proxy_url", &self.proxy_url.as_ref().map(Url::as_str))
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl ClusterConfig {
    /// Configuration for a bare server URL with no credentials
    pub fn new(server: &str) -> Result<Self, PodtunnelError> {
        let server = Url::parse(server)
            .map_err(|e| PodtunnelError::Config(format!("Invalid server URL '{}': {}", server, e)))?;
        match server.scheme() {
            "http" | "https" => {}
            other => {
                return Err(PodtunnelError::Config(format!(
                    "Unsupported server URL scheme '{}'", other
                )));
            }
        }
        Ok(Self {
            server,
            token: None,
            username: None,
            password: None,
            tls: TlsSettings::default(),
            proxy_url: None,
            namespace: None,
        })
    }

    /// Use a bearer token for authentication
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Load from a kubeconfig file, using `context` or the current context
    pub fn from_kubeconfig(path: &Path, context: Option<&str>) -> Result<Self, PodtunnelError> {
        let kubeconfig = Kubeconfig::from_path(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        kubeconfig.resolve(context, base_dir)
    }

    /// Locate cluster configuration the way kubectl does
    ///
    /// An explicit path wins, then the first entry of `$KUBECONFIG`, then
    /// `~/.kube/config`, then the in-cluster service account.
    pub fn load(path: Option<&Path>, context: Option<&str>) -> Result<Self, PodtunnelError> {
        if let Some(path) = path {
            return Self::from_kubeconfig(path, context);
        }

        if let Some(path) = Self::default_kubeconfig_path() {
            return Self::from_kubeconfig(&path, context);
        }

        if std::env::var_os("KUBERNETES_SERVICE_HOST").is_some() {
            return Self::in_cluster();
        }

        Err(PodtunnelError::Config(
            "No kubeconfig found and not running inside a cluster".to_string()
        ))
    }

    /// First existing kubeconfig from `$KUBECONFIG` or `~/.kube/config`
    pub fn default_kubeconfig_path() -> Option<PathBuf> {
        if let Some(paths) = std::env::var_os("KUBECONFIG") {
            for path in std::env::split_paths(&paths) {
                if path.is_file() {
                    return Some(path);
                }
            }
        }

        dirs::home_dir()
            .map(|home| home.join(".kube").join("config"))
            .filter(|path| path.is_file())
    }

    /// Service account credentials mounted into every pod
    pub fn in_cluster() -> Result<Self, PodtunnelError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| PodtunnelError::Config("KUBERNETES_SERVICE_HOST is not set".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        // IPv6 hosts need brackets in a URL
        let host = if host.contains(':') { format!("[{}]", host) } else { host };
        let mut config = Self::new(&format!("https://{}:{}", host, port))?;

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(dir.join("token"))
            .map_err(|e| PodtunnelError::Config(format!("Failed to read service account token: {}", e)))?;
        config.token = Some(token.trim().to_string());
        config.tls.ca_pem = std::fs::read(dir.join("ca.crt")).ok();
        config.namespace = std::fs::read_to_string(dir.join("namespace"))
            .ok()
            .map(|ns| ns.trim().to_string());

        Ok(config)
    }
}

/// Dialer tuning on top of the cluster connection
#[derive(Debug, Clone)]
pub struct DialerConfig {
    pub cluster: ClusterConfig,
    /// Bound on the HTTP upgrade (connect, TLS, 101 response)
    pub handshake_timeout: Duration,
    /// Bound on waiting for SYN_REPLY when opening a substream
    pub stream_creation_timeout: Duration,
    /// SPDY keepalive PING interval; `None` disables keepalive
    pub ping_interval: Option<Duration>,
    pub user_agent: String,
}

impl DialerConfig {
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_STREAM_CREATION_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(cluster: ClusterConfig) -> Self {
        Self {
            cluster,
            handshake_timeout: Self::DEFAULT_HANDSHAKE_TIMEOUT,
            stream_creation_timeout: Self::DEFAULT_STREAM_CREATION_TIMEOUT,
            ping_interval: Some(Self::DEFAULT_PING_INTERVAL),
            user_agent: USER_AGENT_STRING.to_string(),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_stream_creation_timeout(mut self, timeout: Duration) -> Self {
        self.stream_creation_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }
}
