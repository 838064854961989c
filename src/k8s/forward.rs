//! Local TCP listener relaying each accepted socket through the dialer

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::PodtunnelError;
use super::parser::Target;
use super::portforward::PortForwardDialer;

/// Forwards local connections to one pod port
#[derive(Debug, Clone)]
pub struct LocalForwarder {
    dialer: Arc<PortForwardDialer>,
    target: Target,
}

impl LocalForwarder {
    pub fn new(dialer: Arc<PortForwardDialer>, target: Target) -> Self {
        Self { dialer, target }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Accept until `shutdown` fires, then abort in-flight relays
    ///
    /// A failed dial only closes the local socket that triggered it.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), PodtunnelError> {
        let local = listener.local_addr()?;
        info!(local = %local, target = %self.target, "Forwarding");

        let mut relays = JoinSet::new();
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
                Some(_) = relays.join_next(), if !relays.is_empty() => continue,
            };
            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            };
            relays.spawn(relay(self.dialer.clone(), self.target.clone(), socket, peer, shutdown.clone()));
        }

        debug!(in_flight = relays.len(), "Forwarder stopping");
        relays.shutdown().await;
        Ok(())
    }
}

async fn relay(
    dialer: Arc<PortForwardDialer>,
    target: Target,
    mut socket: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    let mut conn = match dialer.dial_target(&shutdown, &target).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(peer = %peer, target = %target, error = %e, "Dial failed");
            return;
        }
    };
    debug!(peer = %peer, local = %conn.local_addr(), "Relaying");

    match copy_bidirectional(&mut socket, &mut conn).await {
        Ok((sent, received)) => debug!(peer = %peer, sent, received, "Relay finished"),
        Err(e) => {
            let err = PodtunnelError::from_io(e);
            match err {
                PodtunnelError::RemoteRejected(ref message) => {
                    warn!(peer = %peer, target = %target, message = %message, "Pod rejected connection");
                }
                other => debug!(peer = %peer, error = %other, "Relay ended"),
            }
        }
    }
    let _ = conn.close();
}
