//! CLI argument parsing and the forwarding command

pub mod args;

pub use args::{Args, SecretString};

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ClusterConfig, DialerConfig};
use crate::errors::PodtunnelError;
use crate::k8s::{parse_target, LocalForwarder, PortForwardDialer};

/// Cluster configuration from kubeconfig, overridden by flags
pub fn cluster_config(args: &Args) -> Result<ClusterConfig, PodtunnelError> {
    let mut config = match &args.server {
        Some(server) => ClusterConfig::new(server)?,
        None => ClusterConfig::load(args.kubeconfig.as_deref(), args.context.as_deref())?,
    };
    if let Some(token) = &args.token {
        config.token = Some(token.as_str().to_string());
    }
    if args.insecure_skip_tls_verify {
        config.tls.insecure_skip_verify = true;
    }
    Ok(config)
}

pub fn dialer_config(args: &Args) -> Result<DialerConfig, PodtunnelError> {
    let mut config = DialerConfig::new(cluster_config(args)?)
        .with_handshake_timeout(args.handshake_timeout.into());
    if args.no_keepalive {
        config = config.with_ping_interval(None);
    }
    Ok(config)
}

/// Listen locally and forward until `shutdown` fires
pub async fn run(args: Args, shutdown: CancellationToken) -> Result<(), PodtunnelError> {
    let target = parse_target(&args.target)?;
    let dialer = Arc::new(PortForwardDialer::new(dialer_config(&args)?)?);

    let listener = TcpListener::bind((args.address.as_str(), args.local_port)).await?;
    let local = listener.local_addr()?;
    println!("Forwarding from {} -> {}", local, target.port);

    let forwarder = LocalForwarder::new(dialer.clone(), target);
    forwarder.serve(listener, shutdown).await?;

    info!(sessions = dialer.registry().active_count(), "Shutting down");
    dialer.registry().close_all();
    Ok(())
}
