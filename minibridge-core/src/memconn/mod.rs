//! In-memory network connections.
//!
//! Lets a frontend splice itself onto a backend in the same process without
//! opening a port. A [`Listener`] hands out connected [`MemConn`] pairs that
//! behave like blocking byte-stream sockets: bounded buffers, read and write
//! deadlines, and a `close` that wakes every waiter on both ends.
//!
//! The API is blocking (`std::io::Read`/`Write`); async callers wrap a
//! connection in [`FramedConn`] or run it on `tokio::task::spawn_blocking`.

mod conn;
mod frames;
mod listener;

pub use conn::{DEFAULT_BUFFER_SIZE, MemConn, pair, pair_with_capacity};
pub use frames::FramedConn;
pub use listener::Listener;

use std::io;

/// Network name reported by in-memory addresses.
pub const NETWORK: &str = "memory";

/// Address of an in-memory endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemAddr {
    name: String,
}

impl MemAddr {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn network(&self) -> &'static str {
        NETWORK
    }
}

impl std::fmt::Display for MemAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Failure reasons carried inside the `std::io::Error`s returned by this module.
#[derive(Debug, thiserror::Error)]
pub enum MemConnError {
    #[error("connection closed")]
    Closed,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("listener closed")]
    ListenerClosed,

    #[error("already closed")]
    AlreadyClosed,
}

impl From<MemConnError> for io::Error {
    fn from(err: MemConnError) -> Self {
        let kind = match err {
            MemConnError::Closed => io::ErrorKind::BrokenPipe,
            MemConnError::DeadlineExceeded => io::ErrorKind::TimedOut,
            MemConnError::ListenerClosed => io::ErrorKind::ConnectionRefused,
            MemConnError::AlreadyClosed => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
