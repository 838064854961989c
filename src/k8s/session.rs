//! One upgraded tunnel to a pod, shared by every connection to it

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::errors::PodtunnelError;
use crate::spdy::SpdyConnection;
use super::parser::PodKey;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Upgrade handshake in progress
    Connecting,
    /// Accepting new stream pairs
    Open,
    /// Last connection released; transport shutting down
    Closing,
    /// Terminal
    Closed,
}

/// Handshake outcome, broadcast to every dial waiting on the session
#[derive(Debug, Clone)]
enum Phase {
    Connecting,
    Open,
    Failed(String),
    Closed,
}

/// Result of dropping one connection's hold on a session
pub(crate) enum Release {
    /// Other connections still use the session
    Busy,
    /// That was the last one; the transport (if any) must be shut
    Idle(Option<SpdyConnection>),
}

struct SessionInner {
    state: SessionState,
    next_request_id: u64,
    live: usize,
    transport: Option<SpdyConnection>,
}

/// A tunnel to one (namespace, pod)
///
/// The request id counter and live count sit behind a single lock; the data
/// path never touches it.
pub struct Session {
    key: PodKey,
    inner: Mutex<SessionInner>,
    phase: watch::Sender<Phase>,
    /// Aborts an in-flight handshake once nobody waits for it
    pub(crate) cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("state", &inner.state)
            .field("live", &inner.live)
            .field("next_request_id", &inner.next_request_id)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(key: PodKey) -> Self {
        let (phase, _) = watch::channel(Phase::Connecting);
        Self {
            key,
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                next_request_id: 0,
                live: 0,
                transport: None,
            }),
            phase,
            cancel: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &PodKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Number of connections currently holding the session
    pub fn live_count(&self) -> usize {
        self.lock().live
    }

    /// Underlying transport, once established
    pub fn transport(&self) -> Option<SpdyConnection> {
        self.lock().transport.clone()
    }

    /// Take a hold on the session unless it is already shutting down
    pub(crate) fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Connecting | SessionState::Open => {
                inner.live += 1;
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        }
    }

    pub(crate) fn release(&self) -> Release {
        let mut inner = self.lock();
        inner.live = inner.live.saturating_sub(1);
        if inner.live > 0 {
            return Release::Busy;
        }
        let transport = inner.transport.take();
        if inner.state != SessionState::Closed {
            inner.state = if transport.is_some() {
                SessionState::Closing
            } else {
                SessionState::Closed
            };
        }
        drop(inner);
        self.phase.send_replace(Phase::Closed);
        Release::Idle(transport)
    }

    /// Install the transport; hands it back if the session was abandoned
    pub(crate) fn mark_open(&self, transport: SpdyConnection) -> Result<(), SpdyConnection> {
        let mut inner = self.lock();
        if inner.state != SessionState::Connecting {
            return Err(transport);
        }
        inner.state = SessionState::Open;
        inner.transport = Some(transport);
        drop(inner);
        self.phase.send_replace(Phase::Open);
        Ok(())
    }

    pub(crate) fn mark_failed(&self, reason: String) {
        self.lock().state = SessionState::Closed;
        self.phase.send_replace(Phase::Failed(reason));
    }

    /// The transport is gone; connections still holding leases drain out
    pub(crate) fn mark_closed(&self) {
        let mut inner = self.lock();
        if inner.state != SessionState::Closing {
            inner.state = SessionState::Closed;
        }
        drop(inner);
        self.phase.send_replace(Phase::Closed);
    }

    pub(crate) fn mark_shut(&self) {
        self.lock().state = SessionState::Closed;
    }

    /// Wait for the handshake started by whichever dial created the session
    pub async fn wait_open(&self) -> Result<(), PodtunnelError> {
        let mut phase = self.phase.subscribe();
        let outcome = phase
            .wait_for(|p| !matches!(p, Phase::Connecting))
            .await
            .map(|p| p.clone())
            .map_err(|_| PodtunnelError::DialFailed("session dropped during handshake".to_string()))?;

        match outcome {
            Phase::Open => Ok(()),
            Phase::Failed(reason) => Err(PodtunnelError::DialFailed(reason)),
            Phase::Closed | Phase::Connecting => Err(PodtunnelError::DialFailed(format!(
                "session to {} closed before it was established", self.key
            ))),
        }
    }

    /// Allocate the next request id on an open session
    pub(crate) fn next_request(&self) -> Result<(u64, SpdyConnection), PodtunnelError> {
        let mut inner = self.lock();
        let transport = match (&inner.state, &inner.transport) {
            (SessionState::Open, Some(transport)) => transport.clone(),
            (state, _) => {
                return Err(PodtunnelError::StreamCreationFailed(format!(
                    "session to {} is {:?}", self.key, state
                )));
            }
        };
        let request_id = inner.next_request_id;
        inner.next_request_id += 1;
        Ok((request_id, transport))
    }
}
