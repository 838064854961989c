//! Target descriptor parsing
//!
//! Parses `pods/<name>.<namespace>:<port>` descriptors into their components.

use std::fmt;

use crate::errors::PodtunnelError;

/// Parsed port-forward target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Pod name
    pub pod: String,
    /// Kubernetes namespace
    pub namespace: String,
    /// Port inside the pod's network namespace
    pub port: u16,
}

impl Target {
    /// Key identifying the tunnel this target is reached through
    pub fn pod_key(&self) -> PodKey {
        PodKey {
            namespace: self.namespace.clone(),
            pod: self.pod.clone(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pods/{}.{}:{}", self.pod, self.namespace, self.port)
    }
}

impl std::str::FromStr for Target {
    type Err = PodtunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_target(s)
    }
}

/// A (namespace, pod) pair; one tunnel session exists per key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodKey {
    pub namespace: String,
    pub pod: String,
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)
    }
}

/// Parse a port-forward target descriptor
///
/// # Format
/// ```text
/// pods/<name>.<namespace>:<port>
/// ```
///
/// # Examples
/// ```
/// use podtunnel::k8s::parse_target;
///
/// let target = parse_target("pods/demo.default:8080").unwrap();
/// assert_eq!(target.pod, "demo");
/// assert_eq!(target.namespace, "default");
/// assert_eq!(target.port, 8080);
/// ```
pub fn parse_target(descriptor: &str) -> Result<Target, PodtunnelError> {
    let rest = descriptor.strip_prefix("pods/")
        .ok_or_else(|| PodtunnelError::InvalidTarget(format!(
            "target must start with pods/: {}", descriptor
        )))?;

    let (host, port_str) = rest.rsplit_once(':')
        .ok_or_else(|| PodtunnelError::InvalidTarget(format!(
            "target must include a port: {}", descriptor
        )))?;

    let port: u16 = port_str.parse()
        .map_err(|_| PodtunnelError::InvalidTarget(format!(
            "invalid port in target: {}", port_str
        )))?;
    if port == 0 {
        return Err(PodtunnelError::InvalidTarget(format!(
            "port must be in 1..=65535: {}", descriptor
        )));
    }

    // Pod names may contain dots, namespaces may not
    let (pod, namespace) = host.rsplit_once('.')
        .ok_or_else(|| PodtunnelError::InvalidTarget(format!(
            "target must include a namespace: pods/<name>.<namespace>:<port>. Got: {}",
            descriptor
        )))?;

    if pod.is_empty() {
        return Err(PodtunnelError::InvalidTarget(
            "pod name cannot be empty".to_string()
        ));
    }
    if namespace.is_empty() {
        return Err(PodtunnelError::InvalidTarget(
            "namespace cannot be empty".to_string()
        ));
    }

    Ok(Target {
        pod: pod.to_string(),
        namespace: namespace.to_string(),
        port,
    })
}
