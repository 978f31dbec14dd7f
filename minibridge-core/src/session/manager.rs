use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::{Session, SessionError};
use crate::identity::IdentityFingerprint;

/// Registry of live sessions.
///
/// The map is guarded by one reader/writer lock for structural changes; each
/// session guards its own counters and hooks, so looking up one session never
/// waits on another's traffic. Sessions whose backend connection closes are
/// removed automatically.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session. The manager drops it once its connection closes.
    pub fn register(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .insert(session.id().to_string(), Arc::clone(&session));

        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            session.closed().await;
            let mut sessions = sessions.write();
            if sessions
                .get(session.id())
                .is_some_and(|s| Arc::ptr_eq(s, &session))
            {
                sessions.remove(session.id());
                tracing::debug!(sid = %session.id(), "session removed from registry");
            }
        });
    }

    /// Takes a reference on the session `sid`, registering `hook` to receive
    /// backend frames when given. Returns `None` for unknown or closed sessions.
    pub fn acquire(&self, sid: &str, hook: Option<mpsc::Sender<Bytes>>) -> Option<Arc<Session>> {
        let sessions = self.sessions.read();
        let session = sessions.get(sid).filter(|s| !s.is_closed())?;

        session.acquire();
        if let Some(hook) = hook {
            session.register_hook(hook);
        }
        Some(Arc::clone(session))
    }

    /// Like [`SessionManager::acquire`], but only for the principal that
    /// created the session.
    pub fn acquire_for(
        &self,
        sid: &str,
        identity: IdentityFingerprint,
        hook: Option<mpsc::Sender<Bytes>>,
    ) -> Result<Arc<Session>, SessionError> {
        {
            let sessions = self.sessions.read();
            let session = sessions.get(sid).ok_or_else(|| SessionError::NotFound {
                sid: sid.to_string(),
            })?;
            if !session.validate_identity(identity) {
                tracing::warn!(sid, "session identity mismatch");
                return Err(SessionError::IdentityMismatch {
                    sid: sid.to_string(),
                });
            }
        }

        self.acquire(sid, hook).ok_or_else(|| SessionError::Closed {
            sid: sid.to_string(),
        })
    }

    /// Drops a reference on `sid`, unregistering `hook` when given. The last
    /// release closes the backend connection and removes the session.
    /// Releasing an unknown session is a no-op.
    pub fn release(&self, sid: &str, hook: Option<&mpsc::Sender<Bytes>>) {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get(sid) else {
            return;
        };

        if let Some(hook) = hook {
            session.unregister_hook(hook);
        }

        if session.release() {
            sessions.remove(sid);
        }
    }

    pub fn get(&self, sid: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(sid).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
