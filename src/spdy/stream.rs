//! SPDY streams as tokio byte streams

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::task::AtomicWaker;
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};

use super::connection::{ConnectionInner, MAX_DATA_FRAME};
use super::frame::{status, Frame};

/// What the reader task delivers to a stream
///
/// Resets bypass the queue: they are recorded in [`StreamState`] and seen
/// by the reader once it has drained what was already delivered.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    Fin,
}

/// Why a stream ended abnormally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetReason {
    /// Peer sent RST_STREAM
    Remote(u32),
    /// We sent RST_STREAM
    Local(u32),
    /// The whole connection went away
    ConnectionLost(String),
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetReason::Remote(code) => write!(f, "stream reset by peer ({})", status::name(*code)),
            ResetReason::Local(code) => write!(f, "stream reset locally ({})", status::name(*code)),
            ResetReason::ConnectionLost(reason) => write!(f, "connection lost: {}", reason),
        }
    }
}

impl ResetReason {
    fn to_io_error(&self) -> io::Error {
        let kind = match self {
            ResetReason::Local(_) => io::ErrorKind::ConnectionAborted,
            _ => io::ErrorKind::ConnectionReset,
        };
        io::Error::new(kind, self.to_string())
    }
}

/// Stream state shared between the connection and the stream handles
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    reset: OnceLock<ResetReason>,
    pub(crate) local_fin: AtomicBool,
    pub(crate) remote_fin: AtomicBool,
    /// Fired when nobody will read this stream's queue again
    pub(crate) gone: CancellationToken,
    reader: AtomicWaker,
}

impl StreamState {
    /// Record a reset; true if this was the first one
    pub(crate) fn mark_reset(&self, reason: ResetReason) -> bool {
        if self.reset.set(reason).is_err() {
            return false;
        }
        self.gone.cancel();
        self.reader.wake();
        true
    }

    pub(crate) fn reset_reason(&self) -> Option<&ResetReason> {
        self.reset.get()
    }

    /// Both directions ended cleanly
    pub(crate) fn is_finished(&self) -> bool {
        self.local_fin.load(Ordering::SeqCst) && self.remote_fin.load(Ordering::SeqCst)
    }
}

/// Releases the stream when the last half is dropped
struct StreamSlot {
    id: u32,
    conn: Arc<ConnectionInner>,
    state: Arc<StreamState>,
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.conn.release_stream(self.id, &self.state);
    }
}

/// A bidirectional SPDY stream
///
/// Implements `AsyncRead` and `AsyncWrite`; `shutdown` sends FIN. Dropping a
/// stream that has not ended in both directions resets it with CANCEL.
pub struct SpdyStream {
    headers: HeaderMap,
    reader: StreamReader,
    writer: StreamWriter,
}

impl fmt::Debug for SpdyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpdyStream")
            .field("id", &self.id())
            .field("headers", &self.headers)
            .finish()
    }
}

impl SpdyStream {
    pub(crate) fn new(
        id: u32,
        headers: HeaderMap,
        conn: Arc<ConnectionInner>,
        state: Arc<StreamState>,
        events: mpsc::Receiver<StreamEvent>,
    ) -> Self {
        let data_tx = conn.data_tx.clone();
        let slot = Arc::new(StreamSlot { id, conn, state });
        Self {
            headers,
            reader: StreamReader {
                slot: slot.clone(),
                events,
                buf: Bytes::new(),
                eof: false,
                failed: None,
            },
            writer: StreamWriter {
                slot,
                tx: PollSender::new(data_tx),
            },
        }
    }

    pub fn id(&self) -> u32 {
        self.reader.slot.id
    }

    /// Headers from the SYN_STREAM that opened the stream
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Split into independently owned read and write halves
    pub fn split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }

    /// Send FIN without waiting for queue space
    pub fn close_write(&self) {
        self.writer.close_write();
    }

    /// Abort the stream in both directions
    pub fn reset(&self, code: u32) {
        self.writer.reset(code);
    }
}

impl AsyncRead for SpdyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for SpdyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

/// Read half of a [`SpdyStream`]
pub struct StreamReader {
    slot: Arc<StreamSlot>,
    events: mpsc::Receiver<StreamEvent>,
    buf: Bytes,
    eof: bool,
    failed: Option<ResetReason>,
}

impl StreamReader {
    pub fn id(&self) -> u32 {
        self.slot.id
    }
}

impl AsyncRead for StreamReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.buf.is_empty() {
                let n = buf.remaining().min(this.buf.len());
                buf.put_slice(&this.buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            if let Some(reason) = &this.failed {
                return Poll::Ready(Err(reason.to_io_error()));
            }
            let state = &this.slot.state;
            match this.events.poll_recv(cx) {
                Poll::Ready(Some(StreamEvent::Data(data))) => this.buf = data,
                Poll::Ready(Some(StreamEvent::Fin)) => this.eof = true,
                Poll::Ready(None) => {
                    let reason = state.reset_reason().cloned().unwrap_or_else(|| {
                        ResetReason::ConnectionLost("stream released".to_string())
                    });
                    this.failed = Some(reason);
                }
                Poll::Pending => {
                    state.reader.register(cx.waker());
                    match state.reset_reason() {
                        Some(reason) => this.failed = Some(reason.clone()),
                        None => return Poll::Pending,
                    }
                }
            }
        }
    }
}

/// Write half of a [`SpdyStream`]
pub struct StreamWriter {
    slot: Arc<StreamSlot>,
    tx: PollSender<Frame>,
}

impl StreamWriter {
    pub fn id(&self) -> u32 {
        self.slot.id
    }

    /// Send FIN without waiting for queue space
    pub fn close_write(&self) {
        let state = &self.slot.state;
        if state.reset_reason().is_none() && !state.local_fin.swap(true, Ordering::SeqCst) {
            self.slot.conn.send_ordered(Frame::fin(self.slot.id));
        }
    }

    /// Abort the stream in both directions
    pub fn reset(&self, code: u32) {
        if self.slot.state.mark_reset(ResetReason::Local(code)) {
            self.slot.conn.send_ordered(Frame::rst(self.slot.id, code));
        }
    }

    fn check_writable(&self) -> io::Result<()> {
        let state = &self.slot.state;
        if let Some(reason) = state.reset_reason() {
            return Err(reason.to_io_error());
        }
        if let Some(reason) = self.slot.conn.is_dead() {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, reason.clone()));
        }
        if state.local_fin.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream write side closed"));
        }
        Ok(())
    }
}

fn queue_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection writer stopped")
}

impl AsyncWrite for StreamWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Err(e) = this.check_writable() {
            this.tx.abort_send();
            return Poll::Ready(Err(e));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(this.tx.poll_reserve(cx)).map_err(|_| queue_closed())?;
        let n = buf.len().min(MAX_DATA_FRAME);
        let frame = Frame::data(this.slot.id, Bytes::copy_from_slice(&buf[..n]), false);
        this.tx.send_item(frame).map_err(|_| queue_closed())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the writer task as soon as they are queued
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let state = &this.slot.state;
        if state.local_fin.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        if let Some(reason) = state.reset_reason() {
            return Poll::Ready(Err(reason.to_io_error()));
        }
        ready!(this.tx.poll_reserve(cx)).map_err(|_| queue_closed())?;
        if this.slot.state.local_fin.swap(true, Ordering::SeqCst) {
            this.tx.abort_send();
            return Poll::Ready(Ok(()));
        }
        this.tx.send_item(Frame::fin(this.slot.id)).map_err(|_| queue_closed())?;
        Poll::Ready(Ok(()))
    }
}
