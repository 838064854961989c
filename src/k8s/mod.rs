//! Kubernetes pod port-forwarding
//!
//! Opens byte-stream connections to a port inside a pod through the API
//! server's `portforward` subresource, without `kubectl` or an in-cluster
//! agent.
//!
//! # Target Format
//! ```text
//! pods/<name>.<namespace>:<port>
//! ```
//!
//! # Examples
//! ```text
//! pods/demo.default:8080
//! pods/postgres-0.databases:5432
//! pods/coredns-5d78c9869d-abcde.kube-system:9153
//! ```

pub mod conn;
pub mod forward;
pub mod parser;
pub mod portforward;
pub mod registry;
pub mod session;
pub mod stream_pair;
pub mod upgrade;

pub use conn::{PodAddr, PortForwardConn, NETWORK};
pub use forward::LocalForwarder;
pub use parser::{parse_target, PodKey, Target};
pub use portforward::PortForwardDialer;
pub use registry::{SessionLease, SessionRegistry};
pub use session::{Session, SessionState};
pub use stream_pair::{open_stream_pair, StreamPair};
pub use upgrade::Upgrader;
