//! HTTP upgrade to SPDY/3.1 on the pod `portforward` subresource

use std::time::Duration;

use http::header::{CONNECTION, UPGRADE};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::{ClusterConfig, DialerConfig};
use crate::errors::PodtunnelError;
use crate::spdy::{ConnectionOptions, SpdyConnection};
use super::parser::PodKey;

/// Sub-protocol negotiated through `X-Stream-Protocol-Version`
pub const PORT_FORWARD_PROTOCOL: &str = "portforward.k8s.io";

pub const STREAM_PROTOCOL_HEADER: &str = "X-Stream-Protocol-Version";

pub const SPDY_PROTOCOL: &str = "SPDY/3.1";

/// Longest response body quoted in a handshake error
const MAX_ERROR_BODY: usize = 1024;

/// The `metav1.Status` fields worth reporting
#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: Option<String>,
}

/// Performs the upgrade handshake and hands back a multiplexed transport
#[derive(Debug, Clone)]
pub struct Upgrader {
    client: reqwest::Client,
    cluster: ClusterConfig,
    handshake_timeout: Duration,
    options: ConnectionOptions,
}

impl Upgrader {
    pub fn new(config: &DialerConfig) -> Result<Self, PodtunnelError> {
        let mut builder = reqwest::Client::builder()
            .http1_only()
            .user_agent(config.user_agent.as_str());

        builder = match &config.cluster.proxy_url {
            Some(proxy) => {
                let proxy = reqwest::Proxy::all(proxy.as_str())
                    .map_err(|e| PodtunnelError::Config(format!("Invalid proxy URL: {}", e)))?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };
        builder = config.cluster.tls.apply_to_builder(builder)?;

        let client = builder.build()
            .map_err(|e| PodtunnelError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            cluster: config.cluster.clone(),
            handshake_timeout: config.handshake_timeout,
            options: ConnectionOptions::client()
                .with_keepalive(config.ping_interval)
                .with_stream_creation_timeout(config.stream_creation_timeout),
        })
    }

    /// `{server}/api/v1/namespaces/{ns}/pods/{pod}/portforward`
    ///
    /// Names are percent-encoded as single path segments; whether they are
    /// valid is for the API server to say.
    pub fn portforward_url(&self, pod: &PodKey) -> Result<Url, PodtunnelError> {
        let mut url = self.cluster.server.clone();
        url.path_segments_mut()
            .map_err(|_| PodtunnelError::DialFailed(format!(
                "server URL cannot carry a path: {}", self.cluster.server
            )))?
            .pop_if_empty()
            .extend(["api", "v1", "namespaces", &pod.namespace, "pods", &pod.pod, "portforward"]);
        Ok(url)
    }

    /// Upgrade a fresh HTTP/1.1 connection and start SPDY on it
    ///
    /// Every failure, including the handshake timeout, is `DialFailed`.
    pub async fn connect(&self, pod: &PodKey) -> Result<SpdyConnection, PodtunnelError> {
        let url = self.portforward_url(pod)?;
        debug!(namespace = %pod.namespace, pod = %pod.pod, url = %url, "Upgrading to SPDY");

        let upgraded = tokio::time::timeout(self.handshake_timeout, self.upgrade(url))
            .await
            .map_err(|_| PodtunnelError::DialFailed(format!(
                "upgrade handshake for {} timed out after {}",
                pod, humantime::format_duration(self.handshake_timeout)
            )))??;

        Ok(SpdyConnection::new(upgraded, self.options.clone()))
    }

    async fn upgrade(&self, url: Url) -> Result<reqwest::Upgraded, PodtunnelError> {
        let mut request = self.client.post(url)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, SPDY_PROTOCOL)
            .header(STREAM_PROTOCOL_HEADER, PORT_FORWARD_PROTOCOL);

        if let Some(token) = &self.cluster.token {
            request = request.bearer_auth(token);
        } else if let Some(username) = &self.cluster.username {
            request = request.basic_auth(username, self.cluster.password.as_ref());
        }

        let response = request.send().await
            .map_err(|e| PodtunnelError::DialFailed(describe_request_error(&e)))?;

        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS {
            let body = response.text().await.unwrap_or_default();
            return Err(PodtunnelError::DialFailed(rejection_message(status, &body)));
        }

        match response.headers().get(STREAM_PROTOCOL_HEADER) {
            Some(value) if value.as_bytes() == PORT_FORWARD_PROTOCOL.as_bytes() => {}
            Some(value) => {
                return Err(PodtunnelError::DialFailed(format!(
                    "server negotiated unsupported stream protocol {:?}", value
                )));
            }
            None => warn!("Upgrade response did not confirm {}", PORT_FORWARD_PROTOCOL),
        }

        response.upgrade().await
            .map_err(|e| PodtunnelError::DialFailed(format!("upgrade failed: {}", e)))
    }
}

/// Prefer the API server's own explanation over the bare status
fn rejection_message(status: StatusCode, body: &str) -> String {
    if let Ok(ApiStatus { message: Some(message) }) = serde_json::from_str::<ApiStatus>(body) {
        if !message.is_empty() {
            return message;
        }
    }

    let body = body.trim();
    if body.is_empty() {
        return format!("unexpected response {}", status);
    }
    let mut end = body.len().min(MAX_ERROR_BODY);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("unexpected response {}: {}", status, &body[..end])
}

fn describe_request_error(err: &reqwest::Error) -> String {
    if err.is_connect() {
        format!("failed to connect to API server: {}", err)
    } else if err.is_timeout() {
        format!("API server timed out: {}", err)
    } else {
        format!("upgrade request failed: {}", err)
    }
}
