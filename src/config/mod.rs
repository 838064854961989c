//! Configuration: cluster access and dialer tuning

#[allow(clippy::module_inception)]
pub mod config;
pub mod kubeconfig;

pub use config::{ClusterConfig, DialerConfig, USER_AGENT_STRING};
pub use kubeconfig::Kubeconfig;
