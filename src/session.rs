//! Client sessions and their cleanup hook.
//!
//! A session is one connected client context. The broker only needs a stable,
//! comparable identity; everything else about the connection belongs to the
//! transport. When a session ends, every component that may hold state for it
//! (brokers, devices, the registry, the notification router) is told through
//! [`SessionScoped::on_session_closed`].
//!
//! [`SessionManager`] hands out ids and keeps the list of participants to
//! notify. [`SessionHandle`] closes its session when dropped, so a transport
//! that loses a connection cannot leak locks by forgetting to clean up.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Opaque identity of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw id supplied by the transport.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Component that holds per-session state and must release it on disconnect.
///
/// Cleanup never fails: closing a session that holds nothing is a no-op.
pub trait SessionScoped: Send + Sync {
    /// Release everything held on behalf of `session`.
    fn on_session_closed(&self, session: SessionId);
}

/// Bookkeeping for an open session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// The session's id.
    pub id: SessionId,
    /// Free-form label supplied by the transport (peer address, client name).
    pub label: String,
    /// When the session was opened.
    pub opened_at: DateTime<Utc>,
}

/// Allocates session ids and fans session-closed events out to participants.
pub struct SessionManager {
    next_id: AtomicU64,
    open: Mutex<HashMap<SessionId, SessionInfo>>,
    participants: RwLock<Vec<Arc<dyn SessionScoped>>>,
}

impl SessionManager {
    /// Create a manager with no participants. Ids start at 1.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
            participants: RwLock::new(Vec::new()),
        })
    }

    /// Add a component to notify whenever a session closes.
    pub fn register(&self, participant: Arc<dyn SessionScoped>) {
        self.participants.write().push(participant);
    }

    /// Open a new session. The session closes when the handle is dropped.
    pub fn open(self: &Arc<Self>, label: impl Into<String>) -> SessionHandle {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let info = SessionInfo {
            id,
            label: label.into(),
            opened_at: Utc::now(),
        };
        info!(session = %id, label = %info.label, "Session opened");
        self.open.lock().insert(id, info);

        SessionHandle {
            id,
            manager: Arc::clone(self),
            closed: false,
        }
    }

    /// Close a session and run cleanup on every participant.
    ///
    /// Cleanup runs even for ids this manager never issued, so a transport
    /// that tracks its own ids can still use the fan-out. Returns whether the
    /// session was known to be open.
    pub fn close(&self, session: SessionId) -> bool {
        let was_open = self.open.lock().remove(&session).is_some();

        // Snapshot so participants may register others while cleaning up.
        let participants: Vec<_> = self.participants.read().iter().cloned().collect();
        for participant in participants {
            participant.on_session_closed(session);
        }

        if was_open {
            info!(session = %session, "Session closed");
        } else {
            debug!(session = %session, "Cleanup ran for untracked session");
        }
        was_open
    }

    /// Whether `session` is currently open.
    pub fn is_open(&self, session: SessionId) -> bool {
        self.open.lock().contains_key(&session)
    }

    /// All open sessions, oldest first.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.open.lock().values().cloned().collect();
        sessions.sort_by_key(|info| info.id);
        sessions
    }
}

/// RAII handle for an open session.
///
/// Dropping the handle closes the session and releases every lock it holds.
pub struct SessionHandle {
    id: SessionId,
    manager: Arc<SessionManager>,
    closed: bool,
}

impl SessionHandle {
    /// The id of this session.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Close the session now.
    pub fn close(mut self) {
        self.close_now();
    }

    fn close_now(&mut self) {
        if !self.closed {
            self.closed = true;
            self.manager.close(self.id);
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        closed: Mutex<Vec<SessionId>>,
    }

    impl SessionScoped for Recorder {
        fn on_session_closed(&self, session: SessionId) {
            self.closed.lock().push(session);
        }
    }

    #[test]
    fn test_ids_are_unique() {
        let manager = SessionManager::new();
        let a = manager.open("a");
        let b = manager.open("b");
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.sessions().len(), 2);
    }

    #[test]
    fn test_drop_closes_session() {
        let manager = SessionManager::new();
        let recorder = Arc::new(Recorder::default());
        manager.register(recorder.clone());

        let handle = manager.open("client");
        let id = handle.id();
        assert!(manager.is_open(id));

        drop(handle);

        assert!(!manager.is_open(id));
        assert_eq!(*recorder.closed.lock(), vec![id]);
    }

    #[test]
    fn test_explicit_close_runs_cleanup_once() {
        let manager = SessionManager::new();
        let recorder = Arc::new(Recorder::default());
        manager.register(recorder.clone());

        let handle = manager.open("client");
        let id = handle.id();
        handle.close();

        assert_eq!(recorder.closed.lock().len(), 1);
        assert!(!manager.close(id));
        // A second close still fans out but reports the session as unknown.
        assert_eq!(recorder.closed.lock().len(), 2);
    }
}
