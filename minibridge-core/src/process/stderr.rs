//! Bounded capture of a server's stderr.

use std::collections::VecDeque;

/// Default capacity of a [`StderrRing`].
pub const STDERR_RING_CAPACITY: usize = 4096;

/// Fixed-size byte ring keeping the most recent stderr output of a server,
/// dumped when the server exits.
#[derive(Debug, Clone)]
pub struct StderrRing {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl Default for StderrRing {
    fn default() -> Self {
        Self::with_capacity(STDERR_RING_CAPACITY)
    }
}

impl StderrRing {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends one stderr line, evicting the oldest bytes when full.
    pub fn push_line(&mut self, line: &[u8]) {
        self.push(line);
        self.push(b"\n");
    }

    fn push(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(data);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Captured output, lossily decoded.
    pub fn contents(&self) -> String {
        let (a, b) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(self.buf.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
