//! Port-forward dialer
//!
//! Turns `pods/<name>.<namespace>:<port>` into a connection relayed through
//! the API server, reusing one tunnel per pod.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::DialerConfig;
use crate::errors::PodtunnelError;
use super::conn::PortForwardConn;
use super::parser::{parse_target, Target};
use super::registry::SessionRegistry;
use super::stream_pair::open_stream_pair;
use super::upgrade::Upgrader;

/// Entry point for opening forwarded connections
#[derive(Debug, Clone)]
pub struct PortForwardDialer {
    registry: SessionRegistry,
}

impl PortForwardDialer {
    /// Build a dialer; fails only on unusable TLS or proxy settings
    pub fn new(config: DialerConfig) -> Result<Self, PodtunnelError> {
        let upgrader = Upgrader::new(&config)?;
        Ok(Self {
            registry: SessionRegistry::new(upgrader),
        })
    }

    /// Sessions owned by this dialer
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Dial a `pods/<name>.<namespace>:<port>` target
    ///
    /// `cancel` only covers setup: once a connection is returned the token
    /// has no further effect on it.
    pub async fn dial(
        &self,
        cancel: &CancellationToken,
        descriptor: &str,
    ) -> Result<PortForwardConn, PodtunnelError> {
        let target = parse_target(descriptor)?;
        self.dial_target(cancel, &target).await
    }

    /// Dial an already parsed target
    pub async fn dial_target(
        &self,
        cancel: &CancellationToken,
        target: &Target,
    ) -> Result<PortForwardConn, PodtunnelError> {
        if cancel.is_cancelled() {
            return Err(PodtunnelError::Cancelled);
        }

        // Dropping this future on cancellation releases the lease and resets
        // any half-opened stream
        let setup = async {
            let lease = self.registry.acquire(&target.pod_key()).await?;
            let pair = open_stream_pair(lease.session(), target.port).await?;
            debug!(target = %target, request_id = pair.request_id, "Dial complete");
            Ok::<_, PodtunnelError>(PortForwardConn::new(target.clone(), pair, lease))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PodtunnelError::Cancelled),
            result = setup => result,
        }
    }
}
