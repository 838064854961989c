//! SPDY/3.1 stream multiplexing
//!
//! The subset of SPDY/3.1 the Kubernetes API server speaks on upgraded
//! `portforward`, `exec` and `attach` connections: framing, compressed
//! header blocks, stream open/reply/reset, PING and GOAWAY. There is no flow
//! control; the Kubernetes implementation never sends WINDOW_UPDATE.

pub mod connection;
pub mod frame;
pub mod headers;
pub mod stream;

pub use connection::{ConnectionOptions, Role, SpdyConnection};
pub use frame::{status, Frame, SpdyCodec};
pub use stream::{ResetReason, SpdyStream, StreamReader, StreamWriter};

use std::io;
use thiserror::Error;

/// Transport-level errors
#[derive(Error, Debug)]
pub enum SpdyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Header compression error: {0}")]
    Compression(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Connection is going away")]
    GoingAway,

    #[error("Stream refused by peer (status {0})")]
    StreamRefused(u32),

    #[error("Stream ids exhausted")]
    StreamIdsExhausted,

    #[error("Timed out waiting for stream reply")]
    Timeout,
}
