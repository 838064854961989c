//! SPDY connection: one transport, many streams
//!
//! A reader task decodes frames and routes them to per-stream queues; a
//! writer task drains two outbound queues. Control frames (SYN_STREAM,
//! SYN_REPLY, PING) go through an unbounded queue that the writer always
//! serves first. Data, FIN, RST_STREAM and GOAWAY share a bounded queue so
//! they stay ordered with respect to each other and writers see
//! backpressure.
//!
//! Per-stream inbound queues are bounded too. When one is full the reader
//! task stops reading the transport until that stream is read, reset or
//! dropped, which stalls the peer's writes.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::frame::{status, Frame, SpdyCodec, FLAG_FIN};
use super::stream::{ResetReason, SpdyStream, StreamEvent, StreamState};
use super::SpdyError;

/// Largest DATA payload written in one frame
pub(crate) const MAX_DATA_FRAME: usize = 32 * 1024;

/// Frames buffered on the ordered outbound queue before writers wait
const OUTBOUND_QUEUE: usize = 64;

/// Inbound events buffered per stream before the reader task waits
const STREAM_QUEUE: usize = 16;

/// How long a graceful close may spend flushing before the transport is dropped
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Keepalive fails after this many silent intervals
const KEEPALIVE_MISSES: u32 = 3;

const GOAWAY_OK: u32 = 0;

/// Which end of the connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens odd-numbered streams; peer-initiated streams are refused
    Client,
    /// Accepts peer streams via [`SpdyConnection::accept`]
    Server,
}

/// Connection tuning
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub role: Role,
    /// Send a PING at this interval and fail the connection when the peer
    /// stays silent for several intervals
    pub keepalive: Option<Duration>,
    /// How long `open_stream` waits for SYN_REPLY
    pub stream_creation_timeout: Duration,
}

impl ConnectionOptions {
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            keepalive: None,
            stream_creation_timeout: Duration::from_secs(30),
        }
    }

    pub fn server() -> Self {
        Self {
            role: Role::Server,
            ..Self::client()
        }
    }

    pub fn with_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive = interval;
        self
    }

    pub fn with_stream_creation_timeout(mut self, timeout: Duration) -> Self {
        self.stream_creation_timeout = timeout;
        self
    }
}

struct StreamEntry {
    events: mpsc::Sender<StreamEvent>,
    state: Arc<StreamState>,
}

pub(crate) struct ConnectionInner {
    options: ConnectionOptions,
    control_tx: mpsc::UnboundedSender<Frame>,
    pub(crate) data_tx: mpsc::Sender<Frame>,
    streams: DashMap<u32, StreamEntry>,
    pending: DashMap<u32, oneshot::Sender<Result<(), u32>>>,
    next_stream_id: Mutex<u32>,
    last_peer_stream: AtomicU32,
    next_ping_id: AtomicU32,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<SpdyStream>>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SpdyStream>>,
    goaway_received: AtomicBool,
    closing: AtomicBool,
    close_reason: OnceLock<String>,
    /// Fired once the transport is dead for any reason
    done: CancellationToken,
    writer_done: CancellationToken,
    epoch: Instant,
    last_activity_ms: AtomicU64,
    /// The reader task is waiting for a full stream queue to drain
    reader_stalled: AtomicBool,
}

/// Handle to a multiplexed SPDY connection
///
/// Cheap to clone; every clone drives the same transport. The transport
/// stays up until [`close`](Self::close) or [`abort`](Self::abort) is called
/// or the peer goes away.
#[derive(Clone)]
pub struct SpdyConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for SpdyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpdyConnection")
            .field("role", &self.inner.options.role)
            .field("streams", &self.inner.streams.len())
            .field("closed", &self.inner.done.is_cancelled())
            .finish()
    }
}

impl SpdyConnection {
    /// Start multiplexing over `io`
    ///
    /// Spawns the reader, writer and (optionally) keepalive tasks on the
    /// current tokio runtime.
    pub fn new<T>(io: T, options: ConnectionOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let first_stream_id = match options.role {
            Role::Client => 1,
            Role::Server => 2,
        };
        let keepalive = options.keepalive;

        let inner = Arc::new(ConnectionInner {
            options,
            control_tx,
            data_tx,
            streams: DashMap::new(),
            pending: DashMap::new(),
            next_stream_id: Mutex::new(first_stream_id),
            last_peer_stream: AtomicU32::new(0),
            next_ping_id: AtomicU32::new(first_stream_id),
            incoming_tx: Mutex::new(Some(incoming_tx)),
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            goaway_received: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            done: CancellationToken::new(),
            writer_done: CancellationToken::new(),
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            reader_stalled: AtomicBool::new(false),
        });

        tokio::spawn(read_loop(
            inner.clone(),
            FramedRead::new(read_half, SpdyCodec::new()),
        ));
        tokio::spawn(write_loop(
            inner.clone(),
            FramedWrite::new(write_half, SpdyCodec::new()),
            control_rx,
            data_rx,
        ));
        if let Some(interval) = keepalive {
            tokio::spawn(keepalive_loop(inner.clone(), interval));
        }

        Self { inner }
    }

    pub fn role(&self) -> Role {
        self.inner.options.role
    }

    /// Open a new stream and wait for the peer's SYN_REPLY
    pub async fn open_stream(&self, headers: HeaderMap) -> Result<SpdyStream, SpdyError> {
        let inner = &self.inner;
        if let Some(reason) = inner.close_reason.get() {
            return Err(SpdyError::ConnectionClosed(reason.clone()));
        }
        if inner.closing.load(Ordering::SeqCst) || inner.goaway_received.load(Ordering::SeqCst) {
            return Err(SpdyError::GoingAway);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let stream = {
            // Ids must reach the wire in increasing order
            let mut next = inner.next_stream_id.lock().unwrap_or_else(PoisonError::into_inner);
            let stream_id = *next;
            if stream_id > 0x7fff_ffff {
                return Err(SpdyError::StreamIdsExhausted);
            }
            *next += 2;

            inner.pending.insert(stream_id, reply_tx);
            let stream = inner.register(stream_id, headers.clone());
            let syn = Frame::SynStream {
                stream_id,
                associated_stream_id: 0,
                priority: 0,
                flags: 0,
                headers,
            };
            if inner.control_tx.send(syn).is_err() {
                inner.pending.remove(&stream_id);
                return Err(SpdyError::ConnectionClosed("writer stopped".to_string()));
            }
            stream
        };
        let stream_id = stream.id();

        // terminate() may have drained `pending` before our insert
        if let Some(reason) = inner.close_reason.get() {
            inner.pending.remove(&stream_id);
            return Err(SpdyError::ConnectionClosed(reason.clone()));
        }

        trace!(stream_id, "waiting for SYN_REPLY");
        match tokio::time::timeout(inner.options.stream_creation_timeout, reply_rx).await {
            Ok(Ok(Ok(()))) => Ok(stream),
            Ok(Ok(Err(code))) => Err(SpdyError::StreamRefused(code)),
            Ok(Err(_)) => Err(SpdyError::ConnectionClosed(
                inner.close_reason.get().cloned().unwrap_or_else(|| "connection closed".to_string()),
            )),
            Err(_) => {
                inner.pending.remove(&stream_id);
                Err(SpdyError::Timeout)
            }
        }
    }

    /// Next stream opened by the peer; `None` once the connection is gone
    pub async fn accept(&self) -> Option<SpdyStream> {
        let mut incoming = self.inner.incoming_rx.lock().await;
        incoming.recv().await
    }

    /// Reset a stream, ordered after any data already queued for it
    pub fn reset_stream(&self, stream_id: u32, code: u32) {
        self.inner.reset_stream(stream_id, code);
    }

    /// Half-close our side of a stream if it is still open
    pub fn finish_stream(&self, stream_id: u32) {
        let Some(entry) = self.inner.streams.get(&stream_id) else {
            return;
        };
        let state = entry.state.clone();
        drop(entry);
        if !state.local_fin.swap(true, Ordering::SeqCst) && state.reset_reason().is_none() {
            self.inner.send_ordered(Frame::fin(stream_id));
        }
    }

    /// Gracefully close: flush queued frames, send GOAWAY, drop the transport
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closing.swap(true, Ordering::SeqCst) || inner.close_reason.get().is_some() {
            inner.done.cancelled().await;
            return;
        }

        let goaway = Frame::GoAway {
            last_good_stream_id: inner.last_peer_stream.load(Ordering::SeqCst),
            status: GOAWAY_OK,
        };
        let graceful = async {
            if inner.data_tx.send(goaway).await.is_ok() {
                inner.writer_done.cancelled().await;
            }
        };
        if tokio::time::timeout(CLOSE_GRACE, graceful).await.is_err() {
            debug!("graceful close timed out, dropping transport");
        }
        inner.terminate("connection closed".to_string());
    }

    /// Drop the transport immediately, resetting every stream
    pub fn abort(&self) {
        self.inner.terminate("connection aborted".to_string());
    }

    /// Resolves once the transport is dead
    pub async fn closed(&self) {
        self.inner.done.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Why the connection went away, if it has
    pub fn close_reason(&self) -> Option<String> {
        self.inner.close_reason.get().cloned()
    }

    /// Number of streams currently tracked
    pub fn stream_count(&self) -> usize {
        self.inner.streams.len()
    }
}

impl ConnectionInner {
    pub(crate) fn register(self: &Arc<Self>, stream_id: u32, headers: HeaderMap) -> SpdyStream {
        let (events_tx, events_rx) = mpsc::channel(STREAM_QUEUE);
        let state = Arc::new(StreamState::default());
        self.streams.insert(stream_id, StreamEntry {
            events: events_tx,
            state: state.clone(),
        });
        // Raced with terminate(): the stream is born dead
        if let Some(reason) = self.close_reason.get() {
            self.streams.remove(&stream_id);
            state.mark_reset(ResetReason::ConnectionLost(reason.clone()));
        }
        SpdyStream::new(stream_id, headers, self.clone(), state, events_rx)
    }

    /// Queue a frame behind everything already on the ordered queue
    pub(crate) fn send_ordered(&self, frame: Frame) {
        match self.data_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                let tx = self.data_tx.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = tx.send(frame).await;
                    });
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub(crate) fn is_dead(&self) -> Option<&String> {
        self.close_reason.get()
    }

    fn reset_stream(&self, stream_id: u32, code: u32) {
        let Some((_, entry)) = self.streams.remove(&stream_id) else {
            return;
        };
        if entry.state.mark_reset(ResetReason::Local(code)) {
            if self.close_reason.get().is_none() {
                self.send_ordered(Frame::rst(stream_id, code));
            }
        }
    }

    /// Called when the last handle to a stream goes away
    pub(crate) fn release_stream(&self, stream_id: u32, state: &StreamState) {
        self.streams.remove(&stream_id);
        self.pending.remove(&stream_id);
        state.gone.cancel();
        if state.is_finished() || self.close_reason.get().is_some() {
            return;
        }
        if state.mark_reset(ResetReason::Local(status::CANCEL)) {
            self.send_ordered(Frame::rst(stream_id, status::CANCEL));
        }
    }

    fn terminate(&self, reason: String) {
        if self.close_reason.set(reason.clone()).is_err() {
            return;
        }
        debug!(reason = %reason, streams = self.streams.len(), "SPDY connection terminated");

        self.closing.store(true, Ordering::SeqCst);
        self.pending.clear();
        self.streams.retain(|_, entry| {
            entry.state.mark_reset(ResetReason::ConnectionLost(reason.clone()));
            false
        });
        self.incoming_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.done.cancel();
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        self.epoch.elapsed().saturating_sub(Duration::from_millis(last))
    }

    fn own_parity(&self) -> u32 {
        match self.options.role {
            Role::Client => 1,
            Role::Server => 0,
        }
    }

    /// Hand an event to a stream, waiting while its queue is full
    async fn deliver(&self, events: &mpsc::Sender<StreamEvent>, state: &StreamState, event: StreamEvent) {
        let event = match events.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => return,
            Err(TrySendError::Full(event)) => event,
        };
        trace!("stream queue full, transport reads paused");
        self.reader_stalled.store(true, Ordering::SeqCst);
        tokio::select! {
            _ = events.send(event) => {}
            _ = state.gone.cancelled() => {}
            _ = self.done.cancelled() => {}
        }
        self.reader_stalled.store(false, Ordering::SeqCst);
        self.touch();
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Data { stream_id, flags, data } => {
                let Some((events, state)) = self.streams
                    .get(&stream_id)
                    .map(|entry| (entry.events.clone(), entry.state.clone()))
                else {
                    trace!(stream_id, len = data.len(), "data for unknown stream dropped");
                    return;
                };
                if !data.is_empty() {
                    self.deliver(&events, &state, StreamEvent::Data(data)).await;
                }
                if flags & FLAG_FIN != 0 {
                    state.remote_fin.store(true, Ordering::SeqCst);
                    self.deliver(&events, &state, StreamEvent::Fin).await;
                }
            }
            Frame::SynStream { stream_id, flags, headers, .. } => {
                self.accept_peer_stream(stream_id, flags, headers);
            }
            Frame::SynReply { stream_id, flags, .. } => {
                if let Some((_, reply)) = self.pending.remove(&stream_id) {
                    let _ = reply.send(Ok(()));
                }
                if flags & FLAG_FIN != 0 {
                    if let Some(entry) = self.streams.get(&stream_id) {
                        entry.state.remote_fin.store(true, Ordering::SeqCst);
                        // Nothing has been queued on a stream that was just answered
                        let _ = entry.events.try_send(StreamEvent::Fin);
                    }
                }
            }
            Frame::RstStream { stream_id, status: code } => {
                debug!(stream_id, status = status::name(code), "stream reset by peer");
                if let Some((_, reply)) = self.pending.remove(&stream_id) {
                    let _ = reply.send(Err(code));
                }
                if let Some((_, entry)) = self.streams.remove(&stream_id) {
                    entry.state.mark_reset(ResetReason::Remote(code));
                }
            }
            Frame::Ping { id } => {
                if id % 2 != self.own_parity() {
                    let _ = self.control_tx.send(Frame::Ping { id });
                }
            }
            Frame::GoAway { last_good_stream_id, status: code } => {
                debug!(last_good_stream_id, status = code, "GOAWAY received");
                self.goaway_received.store(true, Ordering::SeqCst);
            }
            Frame::Settings { .. } | Frame::WindowUpdate { .. } | Frame::Headers { .. } => {}
        }
    }

    fn accept_peer_stream(self: &Arc<Self>, stream_id: u32, flags: u8, headers: HeaderMap) {
        if self.options.role == Role::Client || self.closing.load(Ordering::SeqCst) {
            let _ = self.control_tx.send(Frame::rst(stream_id, status::REFUSED_STREAM));
            return;
        }
        let last = self.last_peer_stream.load(Ordering::SeqCst);
        if stream_id % 2 == self.own_parity() || stream_id <= last {
            warn!(stream_id, last, "peer opened stream with invalid id");
            let _ = self.control_tx.send(Frame::rst(stream_id, status::PROTOCOL_ERROR));
            return;
        }
        self.last_peer_stream.store(stream_id, Ordering::SeqCst);

        let stream = self.register(stream_id, headers);
        let _ = self.control_tx.send(Frame::SynReply {
            stream_id,
            flags: 0,
            headers: HeaderMap::new(),
        });
        if flags & FLAG_FIN != 0 {
            if let Some(entry) = self.streams.get(&stream_id) {
                entry.state.remote_fin.store(true, Ordering::SeqCst);
                let _ = entry.events.try_send(StreamEvent::Fin);
            }
        }

        let incoming = self.incoming_tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = incoming.as_ref() {
            let _ = tx.send(stream);
        }
    }
}

async fn read_loop<R>(inner: Arc<ConnectionInner>, mut frames: FramedRead<R, SpdyCodec>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = inner.done.cancelled() => return,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                inner.touch();
                inner.handle_frame(frame).await;
            }
            Some(Err(e)) => {
                inner.terminate(format!("read failed: {}", e));
                return;
            }
            None => {
                inner.terminate("connection closed by peer".to_string());
                return;
            }
        }
    }
}

async fn write_loop<W>(
    inner: Arc<ConnectionInner>,
    mut sink: FramedWrite<W, SpdyCodec>,
    mut control_rx: mpsc::UnboundedReceiver<Frame>,
    mut data_rx: mpsc::Receiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    let _exit = inner.writer_done.clone().drop_guard();
    let work = async {
        match pump(&mut sink, &mut control_rx, &mut data_rx).await {
            Ok(()) => {
                let _ = sink.close().await;
            }
            Err(e) => inner.terminate(format!("write failed: {}", e)),
        }
    };
    tokio::select! {
        _ = inner.done.cancelled() => {}
        _ = work => {}
    }
}

/// Write frames until a GOAWAY goes out
async fn pump<W>(
    sink: &mut FramedWrite<W, SpdyCodec>,
    control_rx: &mut mpsc::UnboundedReceiver<Frame>,
    data_rx: &mut mpsc::Receiver<Frame>,
) -> Result<(), SpdyError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            Some(frame) = control_rx.recv() => frame,
            Some(frame) = data_rx.recv() => frame,
            else => return Ok(()),
        };
        let goaway = matches!(frame, Frame::GoAway { .. });
        sink.send(frame).await?;
        if goaway {
            return Ok(());
        }
    }
}

async fn keepalive_loop(inner: Arc<ConnectionInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = inner.done.cancelled() => return,
            _ = ticker.tick() => {}
        }
        // Silence is expected while we are the ones not reading
        if inner.reader_stalled.load(Ordering::SeqCst) {
            continue;
        }
        if inner.idle_for() > interval * KEEPALIVE_MISSES {
            warn!(idle_ms = inner.idle_for().as_millis() as u64, "SPDY keepalive timed out");
            inner.terminate("keepalive timeout".to_string());
            return;
        }
        let id = inner.next_ping_id.fetch_add(2, Ordering::SeqCst);
        if inner.control_tx.send(Frame::Ping { id }).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (SpdyConnection, SpdyConnection) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            SpdyConnection::new(a, ConnectionOptions::client()),
            SpdyConnection::new(b, ConnectionOptions::server()),
        )
    }

    fn named(name: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("name", HeaderValue::from_static(name));
        headers
    }

    #[tokio::test]
    async fn test_open_accept_and_exchange() {
        let (client, server) = pair();

        let opener = tokio::spawn(async move {
            let mut stream = client.open_stream(named("first")).await.unwrap();
            assert_eq!(stream.id(), 1);
            stream.write_all(b"ping").await.unwrap();
            stream.shutdown().await.unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let mut accepted = server.accept().await.unwrap();
        assert_eq!(accepted.headers().get("name").unwrap(), "first");
        let mut got = Vec::new();
        accepted.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ping");
        accepted.write_all(b"pong").await.unwrap();
        accepted.shutdown().await.unwrap();

        assert_eq!(opener.await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_stream_ids_are_odd_and_increasing() {
        let (client, server) = pair();
        let acceptor = tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..3 {
                ids.push(server.accept().await.unwrap().id());
            }
            ids
        });
        let mut streams = Vec::new();
        for _ in 0..3 {
            streams.push(client.open_stream(named("s")).await.unwrap());
        }
        assert_eq!(acceptor.await.unwrap(), vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn test_client_refuses_peer_streams() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = SpdyConnection::new(a, ConnectionOptions::client());
        // Both ends as clients: the peer's SYN_STREAM is refused
        let other = SpdyConnection::new(b, ConnectionOptions::client());
        let err = other.open_stream(named("x")).await.unwrap_err();
        assert!(matches!(err, SpdyError::StreamRefused(status::REFUSED_STREAM)));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_abort_resets_open_streams() {
        let (client, server) = pair();
        let accept = tokio::spawn(async move {
            let stream = server.accept().await.unwrap();
            (server, stream)
        });
        let mut stream = client.open_stream(named("s")).await.unwrap();
        let (server, _held) = accept.await.unwrap();

        server.abort();
        let mut buf = [0u8; 8];
        let err = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

        tokio::time::timeout(Duration::from_secs(5), client.closed()).await.unwrap();
        assert!(client.open_stream(named("late")).await.is_err());
    }

    #[tokio::test]
    async fn test_unread_stream_stalls_the_peer() {
        let (client, server) = pair();
        let accept = tokio::spawn(async move { (server.accept().await.unwrap(), server) });
        let mut stream = client.open_stream(named("s")).await.unwrap();
        let (mut accepted, _server) = accept.await.unwrap();

        const LEN: usize = 16 * 1024 * 1024;
        let writer = tokio::spawn(async move {
            accepted.write_all(&vec![7u8; LEN]).await.unwrap();
            accepted.shutdown().await.unwrap();
            accepted
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!writer.is_finished(), "peer wrote everything while nobody was reading");

        let mut got = Vec::new();
        stream.read_to_end(&mut got).await.unwrap();
        assert_eq!(got.len(), LEN);
        assert!(got.iter().all(|b| *b == 7));
        let _accepted = writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_unread_stream_unblocks_transport() {
        let (client, server) = pair();
        let accept = tokio::spawn(async move {
            let first = server.accept().await.unwrap();
            let second = server.accept().await.unwrap();
            (first, second, server)
        });
        let stalled = client.open_stream(named("stalled")).await.unwrap();
        let mut other = client.open_stream(named("other")).await.unwrap();
        let (mut first, mut second, _server) = accept.await.unwrap();

        let flood = tokio::spawn(async move {
            let _ = first.write_all(&vec![0u8; 16 * 1024 * 1024]).await;
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        let behind = tokio::spawn(async move {
            second.write_all(b"behind").await.unwrap();
            second.shutdown().await.unwrap();
            second
        });

        drop(stalled);
        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), other.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"behind");
        let _second = behind.await.unwrap();
        flood.abort();
    }

    #[tokio::test]
    async fn test_graceful_close_sends_goaway() {
        let (client, server) = pair();
        client.close().await;
        assert!(client.is_closed());
        tokio::time::timeout(Duration::from_secs(5), server.closed()).await.unwrap();
        assert!(server.accept().await.is_none());
    }

    #[tokio::test]
    async fn test_reset_stream_reaches_peer() {
        let (client, server) = pair();
        let accept = tokio::spawn(async move { (server.accept().await.unwrap(), server) });
        let stream = client.open_stream(named("s")).await.unwrap();
        let (mut accepted, _server) = accept.await.unwrap();

        client.reset_stream(stream.id(), status::CANCEL);
        let mut buf = Vec::new();
        let err = accepted.read_to_end(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }
}
