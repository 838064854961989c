//! Session registry: one tunnel per pod, created on first use
//!
//! The registry lock is only held for map lookups and inserts. The upgrade
//! handshake runs on a task of its own; every dial that finds the session
//! still connecting waits on the same outcome. When the last connection
//! releases a session it is removed and its transport closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::errors::PodtunnelError;
use super::parser::PodKey;
use super::session::{Release, Session, SessionState};
use super::upgrade::Upgrader;

struct RegistryInner {
    sessions: Mutex<HashMap<PodKey, Arc<Session>>>,
    upgrader: Upgrader,
}

/// Keyed cache of live sessions
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.active_count())
            .finish()
    }
}

/// A connection's hold on a session; dropping it releases the hold
pub struct SessionLease {
    registry: Arc<RegistryInner>,
    session: Arc<Session>,
}

impl SessionLease {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease").field("session", self.session.key()).finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.release(&self.session);
    }
}

impl SessionRegistry {
    pub fn new(upgrader: Upgrader) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                upgrader,
            }),
        }
    }

    /// Get or create the session for a pod and wait until it is open
    ///
    /// Concurrent callers for the same pod share a single handshake. If it
    /// fails, all of them get the failure and the entry is cleared so a
    /// later dial starts over.
    pub async fn acquire(&self, key: &PodKey) -> Result<SessionLease, PodtunnelError> {
        let lease = {
            let mut sessions = self.inner.lock();

            let existing = sessions.get(key).filter(|s| s.try_acquire()).cloned();
            let session = match existing {
                Some(session) => session,
                None => {
                    let session = Arc::new(Session::new(key.clone()));
                    session.try_acquire();
                    sessions.insert(key.clone(), session.clone());
                    debug!(namespace = %key.namespace, pod = %key.pod, "Creating session");
                    tokio::spawn(establish(self.inner.clone(), session.clone()));
                    session
                }
            };
            SessionLease { registry: self.inner.clone(), session }
        };

        lease.session.wait_open().await?;
        Ok(lease)
    }

    /// Number of sessions in the registry
    pub fn active_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// State of the registered session for a pod, if any
    pub fn session_state(&self, key: &PodKey) -> Option<SessionState> {
        let session = self.inner.lock().get(key).cloned();
        session.map(|s| s.state())
    }

    /// Abort every session; connections on them observe a reset
    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.inner.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.cancel.cancel();
            if let Some(transport) = session.transport() {
                transport.abort();
            }
            session.mark_shut();
        }
    }
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<PodKey, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `session` if it is still the registered one for its key
    fn evict(&self, session: &Arc<Session>) {
        let mut sessions = self.lock();
        if sessions.get(session.key()).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(session.key());
        }
    }

    fn release(&self, session: &Arc<Session>) {
        // Registry lock first so no dial can pick the session up mid-teardown
        let mut sessions = self.lock();
        let transport = match session.release() {
            Release::Busy => return,
            Release::Idle(transport) => transport,
        };
        if sessions.get(session.key()).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(session.key());
        }
        drop(sessions);

        session.cancel.cancel();
        let Some(transport) = transport else {
            return;
        };
        debug!(namespace = %session.key().namespace, pod = %session.key().pod, "Closing idle session");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let session = session.clone();
                handle.spawn(async move {
                    transport.close().await;
                    session.mark_shut();
                });
            }
            Err(_) => {
                transport.abort();
                session.mark_shut();
            }
        }
    }
}

/// Run the upgrade handshake and publish its outcome
async fn establish(registry: Arc<RegistryInner>, session: Arc<Session>) {
    let key = session.key().clone();
    let result = tokio::select! {
        biased;
        _ = session.cancel.cancelled() => {
            debug!(namespace = %key.namespace, pod = %key.pod, "Handshake abandoned");
            return;
        }
        result = registry.upgrader.connect(&key) => result,
    };

    let transport = match result {
        Ok(transport) => transport,
        Err(e) => {
            warn!(namespace = %key.namespace, pod = %key.pod, error = %e, "Session handshake failed");
            registry.evict(&session);
            let reason = match e {
                PodtunnelError::DialFailed(reason) => reason,
                other => other.to_string(),
            };
            session.mark_failed(reason);
            return;
        }
    };

    if let Err(transport) = session.mark_open(transport.clone()) {
        transport.abort();
        return;
    }
    info!(namespace = %key.namespace, pod = %key.pod, "Session established");

    // A dead transport must not be handed to new dials
    tokio::spawn(async move {
        transport.closed().await;
        registry.evict(&session);
        session.mark_closed();
        info!(
            namespace = %key.namespace,
            pod = %key.pod,
            reason = %transport.close_reason().unwrap_or_default(),
            "Session closed"
        );
    });
}
