//! podtunnel - socket-like connections into Kubernetes pods
//!
//! Dials `pods/<name>.<namespace>:<port>` through the API server's
//! port-forward subresource over SPDY/3.1, sharing one upgraded tunnel per
//! pod between all connections to it.
//!
//! ```no_run
//! use podtunnel::config::{ClusterConfig, DialerConfig};
//! use podtunnel::k8s::PortForwardDialer;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> podtunnel::errors::Result<()> {
//! let cluster = ClusterConfig::load(None, None)?;
//! let dialer = PortForwardDialer::new(DialerConfig::new(cluster))?;
//! let conn = dialer.dial(&CancellationToken::new(), "pods/demo.default:8080").await?;
//! conn.write(b"hello").await?;
//! let mut buf = [0u8; 5];
//! conn.read(&mut buf).await?;
//! conn.close()?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod errors;
pub mod k8s;
pub mod logging;
pub mod spdy;
pub mod status;

pub use errors::{PodtunnelError, Result};
pub use k8s::{PortForwardConn, PortForwardDialer};
