//! A forwarded connection that behaves like a socket
//!
//! Reads and writes go straight to the data substream. A background task
//! drains the error substream; a message there closes the connection and is
//! reported as `RemoteRejected` by every later operation.

use std::fmt;
use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::task::AtomicWaker;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::PodtunnelError;
use crate::spdy::{status, SpdyConnection, StreamReader, StreamWriter};
use super::parser::Target;
use super::registry::SessionLease;
use super::stream_pair::{watch_error_stream, StreamPair};

/// Network name reported by the pseudo-addresses
pub const NETWORK: &str = "kubectl-port-forward";

/// How long a read that hit the end of the data stream waits for the error
/// stream to conclude
const ERROR_GRACE: Duration = Duration::from_millis(250);

/// Synthesized endpoint address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodAddr {
    target: Target,
    request_id: Option<u64>,
}

impl PodAddr {
    pub fn network(&self) -> &'static str {
        NETWORK
    }

    pub fn target(&self) -> &Target {
        &self.target
    }
}

impl fmt::Display for PodAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.request_id {
            Some(id) => write!(f, "relay/{}#{}", self.target, id),
            None => write!(f, "{}", self.target),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    /// The node agent reported an error
    Rejected,
    /// `close` was called
    Closed,
}

struct Teardown {
    transport: SpdyConnection,
    data_id: u32,
    error_id: u32,
    lease: SessionLease,
}

struct ReadSide {
    data: StreamReader,
    deadline: Option<Instant>,
    timer: Option<Pin<Box<Sleep>>>,
    grace: Option<Pin<Box<Sleep>>>,
    /// Set once the data stream has ended, with the reset reason if any
    ended: Option<Option<String>>,
}

struct WriteSide {
    data: StreamWriter,
    deadline: Option<Instant>,
    timer: Option<Pin<Box<Sleep>>>,
    shut: bool,
}

/// State shared between the connection and its error stream watcher
pub(crate) struct ConnShared {
    status: Mutex<Status>,
    remote_error: OnceLock<String>,
    error_done: AtomicBool,
    read_waker: AtomicWaker,
    write_waker: AtomicWaker,
    /// Stops the error stream watcher
    pub(crate) stop: CancellationToken,
    teardown: Mutex<Option<Teardown>>,
}

impl ConnShared {
    fn status(&self) -> Status {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Error for operations on a connection that is no longer open
    fn closed_error(&self) -> Option<PodtunnelError> {
        match self.status() {
            Status::Open => None,
            Status::Closed => Some(PodtunnelError::UseOfClosedConnection),
            Status::Rejected => Some(self.rejection()),
        }
    }

    fn rejection(&self) -> PodtunnelError {
        let message = self.remote_error.get().cloned().unwrap_or_default();
        PodtunnelError::RemoteRejected(message)
    }

    /// Map a data stream failure, preferring what we know about why
    fn stream_error(&self, err: io::Error) -> PodtunnelError {
        if let Some(closed) = self.closed_error() {
            return closed;
        }
        PodtunnelError::ConnectionReset(err.to_string())
    }

    pub(crate) fn error_stream_finished(&self, message: Option<String>) {
        if let Some(message) = message {
            if self.remote_error.set(message.clone()).is_ok() {
                let rejected = {
                    let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
                    let open = *status == Status::Open;
                    if open {
                        *status = Status::Rejected;
                    }
                    open
                };
                if rejected {
                    warn!(message = %message, "Port-forward rejected by node agent");
                    self.teardown();
                }
            }
        }
        self.error_done.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    fn wake_all(&self) {
        self.read_waker.wake();
        self.write_waker.wake();
    }

    /// Release the substreams and the session lease, exactly once
    fn teardown(&self) {
        let teardown = self.teardown.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.stop.cancel();
        let Some(teardown) = teardown else {
            return;
        };
        teardown.transport.finish_stream(teardown.data_id);
        teardown.transport.reset_stream(teardown.data_id, status::CANCEL);
        teardown.transport.reset_stream(teardown.error_id, status::CANCEL);
        drop(teardown.lease);
    }
}

/// A connection to a port inside a pod, relayed through the API server
///
/// One reader and one writer may operate concurrently through `&self`;
/// `close` from a third task unblocks both. Dropping the connection closes
/// it.
pub struct PortForwardConn {
    target: Target,
    request_id: u64,
    shared: Arc<ConnShared>,
    read: Mutex<ReadSide>,
    write: Mutex<WriteSide>,
}

impl fmt::Debug for PortForwardConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortForwardConn")
            .field("target", &self.target.to_string())
            .field("request_id", &self.request_id)
            .field("status", &self.shared.status())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll an optional deadline, (re)arming the timer when it changed
fn poll_deadline(
    deadline: Option<Instant>,
    timer: &mut Option<Pin<Box<Sleep>>>,
    cx: &mut Context<'_>,
) -> Poll<()> {
    let Some(deadline) = deadline else {
        *timer = None;
        return Poll::Pending;
    };
    if timer.as_ref().is_none_or(|sleep| sleep.deadline() != deadline) {
        *timer = Some(Box::pin(tokio::time::sleep_until(deadline)));
    }
    match timer {
        Some(sleep) => sleep.as_mut().poll(cx),
        None => Poll::Pending,
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

impl PortForwardConn {
    /// Wrap a freshly opened stream pair; spawns the error stream watcher
    pub(crate) fn new(target: Target, pair: StreamPair, lease: SessionLease) -> Self {
        let StreamPair { request_id, error, data, transport, .. } = pair;
        let (data_reader, data_writer) = data.split();

        let shared = Arc::new(ConnShared {
            status: Mutex::new(Status::Open),
            remote_error: OnceLock::new(),
            error_done: AtomicBool::new(false),
            read_waker: AtomicWaker::new(),
            write_waker: AtomicWaker::new(),
            stop: CancellationToken::new(),
            teardown: Mutex::new(Some(Teardown {
                transport,
                data_id: data_reader.id(),
                error_id: error.id(),
                lease,
            })),
        });
        tokio::spawn(watch_error_stream(error, shared.clone()));

        Self {
            target,
            request_id,
            shared,
            read: Mutex::new(ReadSide {
                data: data_reader,
                deadline: None,
                timer: None,
                grace: None,
                ended: None,
            }),
            write: Mutex::new(WriteSide {
                data: data_writer,
                deadline: None,
                timer: None,
                shut: false,
            }),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Request id shared by this connection's two substreams
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// `relay/pods/<pod>.<ns>:<port>#<request id>`
    pub fn local_addr(&self) -> PodAddr {
        PodAddr { target: self.target.clone(), request_id: Some(self.request_id) }
    }

    /// `pods/<pod>.<ns>:<port>`
    pub fn peer_addr(&self) -> PodAddr {
        PodAddr { target: self.target.clone(), request_id: None }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.status() != Status::Open
    }

    /// Read into `buf`; `Ok(0)` means the pod closed its side
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, PodtunnelError> {
        let mut buf = ReadBuf::new(buf);
        poll_fn(|cx| self.poll_read_inner(cx, &mut buf)).await?;
        Ok(buf.filled().len())
    }

    /// Write all of `buf`
    pub async fn write(&self, buf: &[u8]) -> Result<usize, PodtunnelError> {
        if let Some(err) = self.shared.closed_error() {
            return Err(err);
        }
        let mut written = 0;
        while written < buf.len() {
            written += poll_fn(|cx| self.poll_write_inner(cx, &buf[written..])).await?;
        }
        Ok(written)
    }

    /// Half-close: the pod sees end-of-stream, reads keep working
    pub fn close_write(&self) -> Result<(), PodtunnelError> {
        if let Some(err) = self.shared.closed_error() {
            return Err(err);
        }
        let mut side = lock(&self.write);
        if !side.shut {
            side.shut = true;
            side.data.close_write();
        }
        Ok(())
    }

    /// Close both directions and release the session
    ///
    /// Idempotent: only the first call has any effect.
    pub fn close(&self) -> Result<(), PodtunnelError> {
        let first = {
            let mut status = lock(&self.shared.status);
            let first = *status != Status::Closed;
            *status = Status::Closed;
            first
        };
        if first {
            debug!(target = %self.target, request_id = self.request_id, "Closing port-forward connection");
            self.shared.teardown();
            self.shared.wake_all();
        }
        Ok(())
    }

    /// Set both deadlines; `None` clears them
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Reads after `deadline` fail with `Timeout` until it is moved
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        lock(&self.read).deadline = deadline;
        self.shared.read_waker.wake();
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        lock(&self.write).deadline = deadline;
        self.shared.write_waker.wake();
    }

    fn poll_read_inner(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), PodtunnelError>> {
        self.shared.read_waker.register(cx.waker());
        if let Some(err) = self.shared.closed_error() {
            return Poll::Ready(Err(err));
        }

        let mut guard = lock(&self.read);
        let side = &mut *guard;
        if expired(side.deadline) {
            return Poll::Ready(Err(PodtunnelError::Timeout));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if side.ended.is_none() {
            let before = buf.filled().len();
            match Pin::new(&mut side.data).poll_read(cx, buf) {
                Poll::Ready(Ok(())) if buf.filled().len() > before => return Poll::Ready(Ok(())),
                Poll::Ready(Ok(())) => side.ended = Some(None),
                Poll::Ready(Err(e)) => {
                    if let Some(closed) = self.shared.closed_error() {
                        return Poll::Ready(Err(closed));
                    }
                    side.ended = Some(Some(e.to_string()));
                }
                Poll::Pending => {}
            }
        }

        if let Some(ended) = side.ended.clone() {
            if let Poll::Ready(result) = self.poll_ended(&mut side.grace, ended, cx) {
                return Poll::Ready(result);
            }
        }

        match poll_deadline(side.deadline, &mut side.timer, cx) {
            Poll::Ready(()) => Poll::Ready(Err(PodtunnelError::Timeout)),
            Poll::Pending => Poll::Pending,
        }
    }

    /// The data stream is over; give the error stream a moment to explain
    fn poll_ended(
        &self,
        grace: &mut Option<Pin<Box<Sleep>>>,
        reset: Option<String>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), PodtunnelError>> {
        if self.shared.remote_error.get().is_some() {
            return Poll::Ready(Err(self.shared.rejection()));
        }
        if !self.shared.error_done.load(Ordering::SeqCst) {
            let sleep = grace.get_or_insert_with(|| Box::pin(tokio::time::sleep(ERROR_GRACE)));
            if sleep.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
        }
        match reset {
            None => Poll::Ready(Ok(())),
            Some(reason) => Poll::Ready(Err(PodtunnelError::ConnectionReset(reason))),
        }
    }

    fn poll_write_inner(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, PodtunnelError>> {
        self.shared.write_waker.register(cx.waker());
        if let Some(err) = self.shared.closed_error() {
            return Poll::Ready(Err(err));
        }

        let mut guard = lock(&self.write);
        let side = &mut *guard;
        if side.shut {
            return Poll::Ready(Err(PodtunnelError::UseOfClosedConnection));
        }
        if expired(side.deadline) {
            return Poll::Ready(Err(PodtunnelError::Timeout));
        }

        match Pin::new(&mut side.data).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => return Poll::Ready(Ok(n)),
            Poll::Ready(Err(e)) => return Poll::Ready(Err(self.shared.stream_error(e))),
            Poll::Pending => {}
        }

        match poll_deadline(side.deadline, &mut side.timer, cx) {
            Poll::Ready(()) => Poll::Ready(Err(PodtunnelError::Timeout)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown_inner(&self) -> Poll<io::Result<()>> {
        Poll::Ready(self.close_write().map_err(io::Error::from))
    }
}

impl Drop for PortForwardConn {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl AsyncRead for PortForwardConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.poll_read_inner(cx, buf).map_err(io::Error::from)
    }
}

impl AsyncWrite for PortForwardConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_write_inner(cx, buf).map_err(io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_shutdown_inner()
    }
}

impl AsyncRead for &PortForwardConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.poll_read_inner(cx, buf).map_err(io::Error::from)
    }
}

impl AsyncWrite for &PortForwardConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_write_inner(cx, buf).map_err(io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_shutdown_inner()
    }
}
