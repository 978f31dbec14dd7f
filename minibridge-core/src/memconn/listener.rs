use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{MemAddr, MemConn, MemConnError, NETWORK, pair};

struct Pending {
    seq: u64,
    server_side: MemConn,
}

struct State {
    pending: VecDeque<Pending>,
    next_seq: u64,
    /// Highest sequence number handed to `accept`.
    accepted: Option<u64>,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// In-memory listener. [`Listener::dial`] creates a connection that
/// [`Listener::accept`] returns the server side of.
///
/// Cloning yields another handle on the same listener.
#[derive(Clone)]
pub struct Listener {
    shared: Arc<Shared>,
    addr: MemAddr,
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    next_seq: 0,
                    accepted: None,
                    closed: false,
                }),
                cond: Condvar::new(),
            }),
            addr: MemAddr::new(NETWORK),
        }
    }

    pub fn local_addr(&self) -> &MemAddr {
        &self.addr
    }

    /// Blocks until a client dials, and returns the server side.
    pub fn accept(&self) -> io::Result<MemConn> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(Pending { seq, server_side }) = state.pending.pop_front() {
                state.accepted = Some(seq);
                self.shared.cond.notify_all();
                return Ok(server_side);
            }
            if state.closed {
                return Err(MemConnError::ListenerClosed.into());
            }
            self.shared.cond.wait(&mut state);
        }
    }

    /// Connects to the listener, blocking until the connection is accepted.
    pub fn dial(&self, client_name: &str) -> io::Result<MemConn> {
        self.dial_until(client_name, None)
    }

    /// Like [`Listener::dial`], giving up with `TimedOut` after `timeout`.
    pub fn dial_timeout(&self, client_name: &str, timeout: Duration) -> io::Result<MemConn> {
        self.dial_until(client_name, Some(Instant::now() + timeout))
    }

    fn dial_until(&self, client_name: &str, deadline: Option<Instant>) -> io::Result<MemConn> {
        let (client_side, server_side) = pair(client_name, NETWORK);

        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(MemConnError::ListenerClosed.into());
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push_back(Pending { seq, server_side });
        self.shared.cond.notify_all();

        loop {
            if state.accepted.is_some_and(|accepted| accepted >= seq) {
                tracing::trace!(client = client_name, "memconn dial accepted");
                return Ok(client_side);
            }

            let err = if state.closed {
                Some(MemConnError::ListenerClosed)
            } else if deadline.is_some_and(|d| Instant::now() >= d) {
                Some(MemConnError::DeadlineExceeded)
            } else {
                None
            };
            if let Some(err) = err {
                state.pending.retain(|p| p.seq != seq);
                return Err(err.into());
            }

            match deadline {
                Some(deadline) => {
                    let _ = self.shared.cond.wait_until(&mut state, deadline);
                }
                None => self.shared.cond.wait(&mut state),
            }
        }
    }

    /// Closes the listener. Blocked `accept` and `dial` calls return errors;
    /// connections already accepted stay open. Closing twice fails.
    pub fn close(&self) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(MemConnError::AlreadyClosed.into());
        }
        state.closed = true;
        state.pending.clear();
        self.shared.cond.notify_all();
        Ok(())
    }
}
