use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{MemAddr, MemConnError, NETWORK};

/// Bytes each direction buffers before writers block.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// State shared by both ends of a pair, guarded by one mutex and one
/// condition variable. Every state change notifies all waiters, which is what
/// lets `close` and deadline changes reach blocked calls on either side.
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

struct State {
    /// `inbox[side]` holds bytes readable by `side`.
    inbox: [VecDeque<u8>; 2],
    read_deadline: [Option<Instant>; 2],
    write_deadline: [Option<Instant>; 2],
    capacity: usize,
    /// `write_closed[side]`: `side` shut down its writes; its peer reads EOF
    /// once the inbox is drained.
    write_closed: [bool; 2],
    closed: bool,
}

/// One end of an in-memory connection.
///
/// Reads and writes are also implemented on `&MemConn`, so one thread can read
/// while another writes. Dropping a `MemConn` closes both ends.
pub struct MemConn {
    shared: Arc<Shared>,
    side: usize,
    local: MemAddr,
    remote: MemAddr,
}

/// Creates a connected pair with the default buffer size.
pub fn pair(a_name: &str, b_name: &str) -> (MemConn, MemConn) {
    pair_with_capacity(a_name, b_name, DEFAULT_BUFFER_SIZE)
}

/// Creates a connected pair whose directions each buffer `capacity` bytes.
pub fn pair_with_capacity(a_name: &str, b_name: &str, capacity: usize) -> (MemConn, MemConn) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            inbox: [VecDeque::new(), VecDeque::new()],
            read_deadline: [None; 2],
            write_deadline: [None; 2],
            capacity: capacity.max(1),
            write_closed: [false; 2],
            closed: false,
        }),
        cond: Condvar::new(),
    });

    let a = MemConn {
        shared: Arc::clone(&shared),
        side: 0,
        local: MemAddr::new(a_name),
        remote: MemAddr::new(b_name),
    };
    let b = MemConn {
        shared,
        side: 1,
        local: MemAddr::new(b_name),
        remote: MemAddr::new(a_name),
    };
    (a, b)
}

impl MemConn {
    pub fn local_addr(&self) -> &MemAddr {
        &self.local
    }

    pub fn remote_addr(&self) -> &MemAddr {
        &self.remote
    }

    /// Sets the read deadline. `None` disables it. A deadline in the past
    /// makes pending and future reads fail with `TimedOut` without closing
    /// the connection.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        let mut state = self.lock_open()?;
        state.read_deadline[self.side] = deadline;
        self.shared.cond.notify_all();
        Ok(())
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        let mut state = self.lock_open()?;
        state.write_deadline[self.side] = deadline;
        self.shared.cond.notify_all();
        Ok(())
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        let mut state = self.lock_open()?;
        state.read_deadline[self.side] = deadline;
        state.write_deadline[self.side] = deadline;
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Closes both ends. Blocked reads drain what is buffered then see EOF;
    /// blocked and future writes fail. Closing twice is a no-op.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if !state.closed {
            state.closed = true;
            tracing::trace!(local = %self.local, remote = %self.remote, "memconn closed");
        }
        self.shared.cond.notify_all();
    }

    /// Shuts down this end's writes. The peer reads what is buffered, then
    /// EOF; reads on this end and writes from the peer keep working.
    pub fn shutdown_write(&self) {
        let mut state = self.shared.state.lock();
        state.write_closed[self.side] = true;
        self.shared.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    fn lock_open(&self) -> io::Result<MutexGuard<'_, State>> {
        let state = self.shared.state.lock();
        if state.closed {
            return Err(MemConnError::Closed.into());
        }
        Ok(state)
    }

    fn wait(&self, state: &mut MutexGuard<'_, State>, deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => {
                let _ = self.shared.cond.wait_until(state, deadline);
            }
            None => self.shared.cond.wait(state),
        }
    }

    fn read_blocking(&self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut state = self.shared.state.lock();
        loop {
            let deadline = state.read_deadline[self.side];
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(MemConnError::DeadlineExceeded.into());
            }

            let inbox = &mut state.inbox[self.side];
            if !inbox.is_empty() {
                let n = out.len().min(inbox.len());
                for (dst, src) in out.iter_mut().zip(inbox.drain(..n)) {
                    *dst = src;
                }
                self.shared.cond.notify_all();
                return Ok(n);
            }

            if state.closed || state.write_closed[1 - self.side] {
                return Ok(0);
            }

            self.wait(&mut state, deadline);
        }
    }

    fn write_blocking(&self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let peer = 1 - self.side;
        let mut state = self.shared.state.lock();
        loop {
            if state.closed || state.write_closed[self.side] {
                return Err(MemConnError::Closed.into());
            }

            let deadline = state.write_deadline[self.side];
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(MemConnError::DeadlineExceeded.into());
            }

            let capacity = state.capacity;
            let outbox = &mut state.inbox[peer];
            let space = capacity.saturating_sub(outbox.len());
            if space > 0 {
                let n = data.len().min(space);
                outbox.extend(&data[..n]);
                self.shared.cond.notify_all();
                return Ok(n);
            }

            self.wait(&mut state, deadline);
        }
    }
}

impl std::fmt::Debug for MemConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemConn")
            .field("network", &NETWORK)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

impl Drop for MemConn {
    fn drop(&mut self) {
        self.close();
    }
}

impl Read for &MemConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_blocking(buf)
    }
}

impl Write for &MemConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_blocking(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for MemConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_blocking(buf)
    }
}

impl Write for MemConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_blocking(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
