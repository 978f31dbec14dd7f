//! Agent sessions.
//!
//! A [`Session`] binds one agent conversation to one backend connection. It is
//! reference counted: the creator holds the first reference, every in-flight
//! request acquires another through the [`SessionManager`]. When the count
//! reaches zero the backend connection is closed. A session left at its
//! baseline count with no traffic for the idle timeout releases itself, which
//! reclaims streaming connections abandoned without a disconnect.
//!
//! Frames read from the backend are copied to every registered hook queue.
//! A full hook queue skips the frame and logs, as the process stream does.

mod manager;
mod sse;

pub use manager::SessionManager;
pub use sse::{SESSION_ID_HEADER, new_session_id, sse_endpoint_event, sse_message_event};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::identity::IdentityFingerprint;

/// Default rolling idle window.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Granularity of the idle check.
const TICK: Duration = Duration::from_secs(1);

/// Errors surfaced by session operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session '{sid}' not found")]
    NotFound { sid: String },

    #[error("session '{sid}' does not belong to the caller")]
    IdentityMismatch { sid: String },

    #[error("session '{sid}' is closed")]
    Closed { sid: String },
}

/// Session tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub idle_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Backend connection owned by a session: frames to the backend, frames from
/// it, and a token that closes it.
pub struct SessionConn {
    pub outbound: mpsc::Sender<Bytes>,
    pub inbound: mpsc::Receiver<Bytes>,
    pub close: CancellationToken,
}

/// An active agent session.
pub struct Session {
    id: String,
    identity: IdentityFingerprint,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    close: CancellationToken,
    idle_timeout: Duration,
    count: Mutex<i64>,
    deadline: Mutex<Instant>,
    hooks: Mutex<Vec<mpsc::Sender<Bytes>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("count", &*self.count.lock())
            .field("closed", &self.close.is_cancelled())
            .finish()
    }
}

impl Session {
    /// Creates a session over `conn` and starts its read and idle loop.
    /// The returned session holds one reference.
    pub fn new(
        id: impl Into<String>,
        identity: IdentityFingerprint,
        conn: SessionConn,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (session, inbound) = Self::build(id, identity, conn, options);
        tokio::spawn(Arc::clone(&session).run(inbound));
        session
    }

    fn build(
        id: impl Into<String>,
        identity: IdentityFingerprint,
        conn: SessionConn,
        options: SessionOptions,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let SessionConn {
            outbound,
            inbound,
            close,
        } = conn;

        let session = Arc::new(Self {
            id: id.into(),
            identity,
            outbound: Mutex::new(Some(outbound)),
            close,
            idle_timeout: options.idle_timeout,
            count: Mutex::new(1),
            deadline: Mutex::new(Instant::now() + options.idle_timeout),
            hooks: Mutex::new(Vec::new()),
        });

        tracing::debug!(sid = %session.id, count = 1, "session created");
        (session, inbound)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn count(&self) -> i64 {
        *self.count.lock()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.lock().len()
    }

    /// True when `identity` matches the one the session was created with.
    pub fn validate_identity(&self, identity: IdentityFingerprint) -> bool {
        self.identity == identity
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once the backend connection is closed, from either side.
    pub async fn closed(&self) {
        self.close.cancelled().await
    }

    /// Sends a frame to the backend and pushes the idle deadline back.
    pub async fn write(&self, data: Bytes) -> Result<(), SessionError> {
        self.touch();
        let Some(outbound) = self.outbound.lock().clone() else {
            return Err(self.closed_error());
        };
        tokio::select! {
            res = outbound.send(data) => res.map_err(|_| self.closed_error()),
            _ = self.close.cancelled() => Err(self.closed_error()),
        }
    }

    /// Stops writes to the backend while frames from it keep flowing to the
    /// hooks. The backend sees end of input once queued frames are delivered.
    pub fn end_writes(&self) {
        if self.outbound.lock().take().is_some() {
            tracing::debug!(sid = %self.id, "session writes ended");
        }
    }

    /// Closes the backend connection regardless of the reference count.
    pub fn close(&self) {
        self.close.cancel();
    }

    fn closed_error(&self) -> SessionError {
        SessionError::Closed {
            sid: self.id.clone(),
        }
    }

    fn touch(&self) {
        *self.deadline.lock() = Instant::now() + self.idle_timeout;
    }

    pub(crate) fn acquire(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.touch();
        tracing::debug!(sid = %self.id, count = *count, "session acquired");
    }

    /// Drops one reference. Returns true when this closed the session.
    pub(crate) fn release(&self) -> bool {
        let mut count = self.count.lock();
        *count -= 1;
        let closed = *count <= 0;
        tracing::debug!(sid = %self.id, count = *count, deleted = closed, "session released");
        if closed {
            self.close();
        }
        closed
    }

    /// Drops the baseline reference of a session whose idle deadline has
    /// passed. The count and the deadline are read under the count lock, so
    /// a concurrent acquire (which refreshes the deadline) always wins.
    fn release_if_idle(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 1 || Instant::now() <= *self.deadline.lock() {
            return false;
        }

        *count -= 1;
        tracing::debug!(sid = %self.id, count = *count, "session terminated: deadline exceeded");
        if *count <= 0 {
            self.close();
        }
        true
    }

    pub(crate) fn register_hook(&self, hook: mpsc::Sender<Bytes>) {
        self.hooks.lock().push(hook);
    }

    pub(crate) fn unregister_hook(&self, hook: &mpsc::Sender<Bytes>) {
        self.hooks.lock().retain(|h| !h.same_channel(hook));
    }

    fn dispatch(&self, data: &Bytes) {
        let hooks = self.hooks.lock().clone();
        for hook in hooks {
            if hook.try_send(data.clone()).is_err() {
                tracing::error!(sid = %self.id, "session sent data to inactive hook");
            }
        }
    }

    async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Bytes>) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.close.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(data) => {
                        self.dispatch(&data);
                        self.touch();
                    }
                    None => {
                        tracing::debug!(sid = %self.id, "backend connection closed");
                        self.close();
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.release_if_idle();
                }
            }
        }

        // Hooks of a closed session never receive again.
        self.hooks.lock().clear();
    }
}
