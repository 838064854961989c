//! Error types for podtunnel

use std::io;
use thiserror::Error;

/// Main error type for podtunnel
///
/// Setup failures are returned from `dial`; everything after a connection is
/// established surfaces on the individual read or write that observes it.
#[derive(Error, Debug)]
pub enum PodtunnelError {
    /// Malformed `pods/<name>.<namespace>:<port>` descriptor
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Network, TLS or upgrade handshake failure
    #[error("Dial failed: {0}")]
    DialFailed(String),

    /// The tunnel refused a substream or went away while opening one
    #[error("Stream creation failed: {0}")]
    StreamCreationFailed(String),

    /// The node agent reported an error on the error substream
    #[error("Remote rejected connection: {0}")]
    RemoteRejected(String),

    /// A read or write deadline elapsed; the connection stays usable
    #[error("i/o timeout")]
    Timeout,

    /// The peer or the tunnel closed the connection unexpectedly
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("use of closed network connection")]
    UseOfClosedConnection,

    /// The dial was cancelled before the connection was established
    #[error("Dial cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PodtunnelError {
    /// True for the non-fatal deadline case
    pub fn is_timeout(&self) -> bool {
        matches!(self, PodtunnelError::Timeout)
    }

    /// Recover a typed error from an `io::Error` produced by the
    /// `AsyncRead`/`AsyncWrite` adapters.
    pub fn from_io(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<PodtunnelError>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(typed) = inner.downcast::<PodtunnelError>() {
                    return *typed;
                }
            }
            return PodtunnelError::ConnectionReset("unrecoverable io error".to_string());
        }
        match err.kind() {
            io::ErrorKind::TimedOut => PodtunnelError::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => PodtunnelError::ConnectionReset(err.to_string()),
            _ => PodtunnelError::Io(err),
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            PodtunnelError::InvalidTarget(_) => io::ErrorKind::InvalidInput,
            PodtunnelError::DialFailed(_) => io::ErrorKind::ConnectionRefused,
            PodtunnelError::StreamCreationFailed(_) => io::ErrorKind::ConnectionAborted,
            PodtunnelError::RemoteRejected(_) => io::ErrorKind::ConnectionRefused,
            PodtunnelError::Timeout => io::ErrorKind::TimedOut,
            PodtunnelError::ConnectionReset(_) => io::ErrorKind::ConnectionReset,
            PodtunnelError::UseOfClosedConnection => io::ErrorKind::NotConnected,
            PodtunnelError::Cancelled => io::ErrorKind::Interrupted,
            PodtunnelError::Config(_) => io::ErrorKind::InvalidInput,
            PodtunnelError::Io(e) => e.kind(),
        }
    }
}

impl From<PodtunnelError> for io::Error {
    fn from(err: PodtunnelError) -> Self {
        match err {
            PodtunnelError::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

pub type Result<T> = std::result::Result<T, PodtunnelError>;
