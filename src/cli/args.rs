//! CLI argument definitions using clap

use clap::{ArgAction, Parser};
use std::fmt;
use std::path::PathBuf;

use crate::logging::LogFormat;

/// A string that redacts its value in Debug output to prevent credential leakage
#[derive(Clone, Default)]
pub struct SecretString(pub String);

impl SecretString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "SecretString(\"\")")
        } else {
            write!(f, "SecretString(\"[REDACTED]\")")
        }
    }
}

impl std::str::FromStr for SecretString {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SecretString(s.to_string()))
    }
}

/// podtunnel - forward local TCP ports into a pod through the API server
#[derive(Parser, Debug, Clone)]
#[command(name = "podtunnel", version, about, long_about = None)]
pub struct Args {
    /// Target in the form pods/<name>.<namespace>:<port>
    #[arg(value_name = "TARGET")]
    pub target: String,

    /// Local address to listen on
    #[arg(long = "address", value_name = "ADDR", default_value = "127.0.0.1")]
    pub address: String,

    /// Local port to listen on (0 picks a free port)
    #[arg(short = 'l', long = "local-port", value_name = "PORT", default_value_t = 0)]
    pub local_port: u16,

    // =========================================================================
    // CLUSTER ACCESS
    // =========================================================================

    /// Path to the kubeconfig file
    #[arg(long = "kubeconfig", value_name = "FILE", env = "PODTUNNEL_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use instead of the current one
    #[arg(long = "context", value_name = "NAME")]
    pub context: Option<String>,

    /// API server URL, bypassing kubeconfig
    #[arg(long = "server", value_name = "URL")]
    pub server: Option<String>,

    /// Bearer token for the API server
    #[arg(long = "token", value_name = "TOKEN", env = "PODTUNNEL_TOKEN", hide_env_values = true)]
    pub token: Option<SecretString>,

    /// Skip TLS certificate verification (insecure)
    #[arg(long = "insecure-skip-tls-verify", action = ArgAction::SetTrue)]
    pub insecure_skip_tls_verify: bool,

    // =========================================================================
    // TUNNEL
    // =========================================================================

    /// Upper bound on the upgrade handshake (e.g. 10s, 1m)
    #[arg(long = "handshake-timeout", value_name = "DURATION", default_value = "30s")]
    pub handshake_timeout: humantime::Duration,

    /// Disable SPDY keepalive pings
    #[arg(long = "no-keepalive", action = ArgAction::SetTrue)]
    pub no_keepalive: bool,

    // =========================================================================
    // OUTPUT
    // =========================================================================

    /// Verbose output. Use -vv for even more verbose
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Output format for logs: text (default) or json (JSON Lines)
    #[arg(long = "log-format", value_name = "FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}
