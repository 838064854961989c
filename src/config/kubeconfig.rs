//! Kubeconfig file parsing
//!
//! Only the fields needed to reach the API server are read: the selected
//! context's cluster (server URL, CA, TLS verification) and user (token,
//! basic auth, client certificate).

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use crate::errors::PodtunnelError;
use super::config::ClusterConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(default)]
    pub current_context: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    pub server: String,
    #[serde(default)]
    pub certificate_authority: Option<PathBuf>,
    #[serde(default)]
    pub certificate_authority_data: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    #[serde(default)]
    pub proxy_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NamedUser {
    pub name: String,
    #[serde(default)]
    pub user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, rename = "tokenFile")]
    pub token_file: Option<PathBuf>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_certificate: Option<PathBuf>,
    #[serde(default)]
    pub client_certificate_data: Option<String>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    #[serde(default)]
    pub client_key_data: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

#[derive(Debug, Deserialize)]
pub struct ContextEntry {
    pub cluster: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl Kubeconfig {
    /// Read and parse a kubeconfig file
    pub fn from_path(path: &Path) -> Result<Self, PodtunnelError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PodtunnelError::Config(format!(
                "Failed to read kubeconfig '{}': {}", path.display(), e
            )))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, PodtunnelError> {
        serde_yaml::from_str(content)
            .map_err(|e| PodtunnelError::Config(format!("Invalid kubeconfig YAML: {}", e)))
    }

    /// Build the cluster configuration for a context
    ///
    /// Relative file references resolve against `base_dir`.
    pub fn resolve(&self, context: Option<&str>, base_dir: &Path) -> Result<ClusterConfig, PodtunnelError> {
        let context_name = context
            .map(str::to_string)
            .or_else(|| self.current_context.clone().filter(|c| !c.is_empty()))
            .ok_or_else(|| PodtunnelError::Config(
                "Kubeconfig has no current-context and none was given".to_string()
            ))?;

        let context = self.contexts.iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.context)
            .ok_or_else(|| PodtunnelError::Config(format!(
                "Context '{}' not found in kubeconfig", context_name
            )))?;

        let cluster = self.clusters.iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| PodtunnelError::Config(format!(
                "Cluster '{}' not found in kubeconfig", context.cluster
            )))?;

        let mut config = ClusterConfig::new(&cluster.server)?;
        config.namespace = context.namespace.clone();
        config.tls.insecure_skip_verify = cluster.insecure_skip_tls_verify;
        if let Some(proxy) = cluster.proxy_url.as_deref().filter(|p| !p.is_empty()) {
            let proxy = url::Url::parse(proxy)
                .map_err(|e| PodtunnelError::Config(format!("Invalid proxy-url '{}': {}", proxy, e)))?;
            config.proxy_url = Some(proxy);
        }
        config.tls.ca_pem = inline_or_file(
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
            base_dir,
            "certificate-authority",
        )?;

        if let Some(user_name) = context.user.as_deref().filter(|u| !u.is_empty()) {
            let user = self.users.iter()
                .find(|u| u.name == user_name)
                .map(|u| &u.user)
                .ok_or_else(|| PodtunnelError::Config(format!(
                    "User '{}' not found in kubeconfig", user_name
                )))?;
            apply_user(&mut config, user, base_dir)?;
        }

        Ok(config)
    }
}

fn apply_user(config: &mut ClusterConfig, user: &UserEntry, base_dir: &Path) -> Result<(), PodtunnelError> {
    config.token = match (&user.token, &user.token_file) {
        (Some(token), _) => Some(token.clone()),
        (None, Some(file)) => {
            let path = resolve_path(file, base_dir);
            let token = std::fs::read_to_string(&path)
                .map_err(|e| PodtunnelError::Config(format!(
                    "Failed to read token file '{}': {}", path.display(), e
                )))?;
            Some(token.trim().to_string())
        }
        (None, None) => None,
    };
    config.username = user.username.clone();
    config.password = user.password.clone();

    config.tls.client_cert_pem = inline_or_file(
        user.client_certificate_data.as_deref(),
        user.client_certificate.as_deref(),
        base_dir,
        "client-certificate",
    )?;
    config.tls.client_key_pem = inline_or_file(
        user.client_key_data.as_deref(),
        user.client_key.as_deref(),
        base_dir,
        "client-key",
    )?;
    Ok(())
}

/// `*-data` fields are base64; the plain field names a file
fn inline_or_file(
    data: Option<&str>,
    file: Option<&Path>,
    base_dir: &Path,
    field: &str,
) -> Result<Option<Vec<u8>>, PodtunnelError> {
    if let Some(data) = data.filter(|d| !d.is_empty()) {
        let decoded = STANDARD.decode(data.trim())
            .map_err(|e| PodtunnelError::Config(format!("Invalid base64 in {}-data: {}", field, e)))?;
        return Ok(Some(decoded));
    }
    if let Some(file) = file {
        let path = resolve_path(file, base_dir);
        let bytes = std::fs::read(&path)
            .map_err(|e| PodtunnelError::Config(format!(
                "Failed to read {} '{}': {}", field, path.display(), e
            )))?;
        return Ok(Some(bytes));
    }
    Ok(None)
}

fn resolve_path(path: &Path, base_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
- name: dev-cluster
  cluster:
    server: https://dev.example.com:6443
    certificate-authority-data: Q0EgREFUQQ==
- name: prod-cluster
  cluster:
    server: https://prod.example.com
    insecure-skip-tls-verify: true
    proxy-url: http://proxy.internal:3128
contexts:
- name: dev
  context:
    cluster: dev-cluster
    user: dev-user
    namespace: team-a
- name: prod
  context:
    cluster: prod-cluster
    user: prod-user
users:
- name: dev-user
  user:
    token: dev-token
- name: prod-user
  user:
    username: admin
    password: secret
"#;

    #[test]
    fn test_resolve_current_context() {
        let kubeconfig = Kubeconfig::parse(KUBECONFIG).unwrap();
        let config = kubeconfig.resolve(None, Path::new("/")).unwrap();
        assert_eq!(config.server.as_str(), "https://dev.example.com:6443/");
        assert_eq!(config.token.as_deref(), Some("dev-token"));
        assert_eq!(config.namespace.as_deref(), Some("team-a"));
        assert_eq!(config.tls.ca_pem.as_deref(), Some(&b"CA DATA"[..]));
        assert!(!config.tls.insecure_skip_verify);
    }

    #[test]
    fn test_resolve_named_context() {
        let kubeconfig = Kubeconfig::parse(KUBECONFIG).unwrap();
        let config = kubeconfig.resolve(Some("prod"), Path::new("/")).unwrap();
        assert_eq!(config.username.as_deref(), Some("admin"));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert!(config.tls.insecure_skip_verify);
        assert!(config.token.is_none());
        assert_eq!(config.proxy_url.unwrap().host_str(), Some("proxy.internal"));
    }

    #[test]
    fn test_missing_context() {
        let kubeconfig = Kubeconfig::parse(KUBECONFIG).unwrap();
        let err = kubeconfig.resolve(Some("staging"), Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("staging"));
    }

    #[test]
    fn test_relative_files_resolve_against_kubeconfig_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut token = std::fs::File::create(dir.path().join("token")).unwrap();
        writeln!(token, "file-token").unwrap();

        let content = r#"
current-context: local
clusters:
- name: local
  cluster:
    server: http://127.0.0.1:8001
contexts:
- name: local
  context:
    cluster: local
    user: me
users:
- name: me
  user:
    tokenFile: token
"#;
        let path = dir.path().join("config");
        std::fs::write(&path, content).unwrap();

        let config = ClusterConfig::from_kubeconfig(&path, None).unwrap();
        assert_eq!(config.token.as_deref(), Some("file-token"));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(Kubeconfig::parse("clusters: [").is_err());
    }
}
