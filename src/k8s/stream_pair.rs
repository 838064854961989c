//! Opening the error + data substreams for one forwarded connection

use std::sync::Arc;

use http::{HeaderMap, HeaderValue};
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use crate::errors::PodtunnelError;
use crate::spdy::{status, SpdyConnection, SpdyError, SpdyStream};
use super::conn::ConnShared;
use super::session::Session;

pub const HEADER_STREAM_TYPE: &str = "streamtype";
pub const HEADER_PORT: &str = "port";
pub const HEADER_REQUEST_ID: &str = "requestid";

pub const STREAM_TYPE_ERROR: &str = "error";
pub const STREAM_TYPE_DATA: &str = "data";

/// Largest error message kept from the error substream
const MAX_ERROR_MESSAGE: u64 = 64 * 1024;

/// The two substreams carrying one forwarded connection
#[derive(Debug)]
pub struct StreamPair {
    pub request_id: u64,
    pub port: u16,
    pub error: SpdyStream,
    pub data: SpdyStream,
    /// Transport both streams live on
    pub transport: SpdyConnection,
}

/// Headers tagging a substream as part of a request
pub fn stream_headers(stream_type: &'static str, port: u16, request_id: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(HEADER_STREAM_TYPE, HeaderValue::from_static(stream_type));
    headers.insert(HEADER_PORT, HeaderValue::from(port));
    headers.insert(HEADER_REQUEST_ID, HeaderValue::from(request_id));
    headers
}

/// Open the error stream, then the data stream, under a fresh request id
///
/// The error stream is half-closed right away; nothing is ever written to it.
pub async fn open_stream_pair(session: &Session, port: u16) -> Result<StreamPair, PodtunnelError> {
    let (request_id, transport) = session.next_request()?;
    let key = session.key();

    let error = transport
        .open_stream(stream_headers(STREAM_TYPE_ERROR, port, request_id))
        .await
        .map_err(|e| creation_failed("error", e))?;
    error.close_write();

    let data = match transport.open_stream(stream_headers(STREAM_TYPE_DATA, port, request_id)).await {
        Ok(data) => data,
        Err(e) => {
            error.reset(status::CANCEL);
            return Err(creation_failed("data", e));
        }
    };

    debug!(
        namespace = %key.namespace,
        pod = %key.pod,
        port,
        request_id,
        error_stream = error.id(),
        data_stream = data.id(),
        "Stream pair opened"
    );

    Ok(StreamPair { request_id, port, error, data, transport })
}

fn creation_failed(stream_type: &str, err: SpdyError) -> PodtunnelError {
    PodtunnelError::StreamCreationFailed(format!("{} stream: {}", stream_type, err))
}

/// Drain the error stream and report what the node agent said, if anything
pub(crate) async fn watch_error_stream(stream: SpdyStream, shared: Arc<ConnShared>) {
    let (reader, _writer) = stream.split();
    let read = async move {
        let mut message = Vec::new();
        reader.take(MAX_ERROR_MESSAGE).read_to_end(&mut message).await.map(|_| message)
    };

    let outcome = tokio::select! {
        _ = shared.stop.cancelled() => return,
        outcome = read => outcome,
    };

    let text = match outcome {
        Ok(message) => {
            let text = String::from_utf8_lossy(&message).trim().to_string();
            (!text.is_empty()).then_some(text)
        }
        Err(e) => {
            trace!(error = %e, "error stream ended abnormally");
            None
        }
    };
    shared.error_stream_finished(text);
}
