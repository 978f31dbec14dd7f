use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::MemConn;
use crate::framing::{MAX_MESSAGE_BYTES, sanitize};

const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Newline-delimited frames carried over a [`MemConn`].
///
/// Two named threads pump the blocking connection: one splits incoming
/// bytes into `inbound` frames, the other writes each `outbound` frame
/// followed by `\n`. Dropping every `outbound` sender shuts down this end's
/// writes so the peer reads EOF; `inbound` ends when the peer does the same
/// or the connection closes.
pub struct FramedConn {
    pub inbound: mpsc::Receiver<Bytes>,
    pub outbound: mpsc::Sender<Bytes>,
    pub conn: Arc<MemConn>,
}

impl FramedConn {
    pub fn new(conn: MemConn) -> io::Result<Self> {
        let conn = Arc::new(conn);
        let name = conn.local_addr().to_string();
        let (in_tx, inbound) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (outbound, out_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

        let reader = Arc::clone(&conn);
        thread::Builder::new()
            .name(format!("memconn-read-{name}"))
            .spawn(move || read_frames(&reader, in_tx))?;

        let writer = Arc::clone(&conn);
        thread::Builder::new()
            .name(format!("memconn-write-{name}"))
            .spawn(move || write_frames(&writer, out_rx))?;

        Ok(Self {
            inbound,
            outbound,
            conn,
        })
    }
}

impl std::fmt::Debug for FramedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedConn")
            .field("local", &self.conn.local_addr())
            .field("remote", &self.conn.remote_addr())
            .finish_non_exhaustive()
    }
}

fn read_frames(conn: &MemConn, tx: mpsc::Sender<Bytes>) {
    let mut reader = BufReader::new(conn);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let limit = (MAX_MESSAGE_BYTES + 1) as u64;
        let n = match (&mut reader).take(limit).read_until(b'\n', &mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                if !conn.is_closed() {
                    tracing::debug!(error = %e, "memconn read ended");
                }
                return;
            }
        };

        if n > MAX_MESSAGE_BYTES && !buf.ends_with(b"\n") {
            tracing::warn!(
                max_bytes = MAX_MESSAGE_BYTES,
                "dropping oversized in-memory frame"
            );
            if skip_line(&mut reader).is_err() {
                return;
            }
            continue;
        }

        let line = sanitize(&buf);
        if line.is_empty() {
            continue;
        }
        if tx.blocking_send(Bytes::copy_from_slice(line)).is_err() {
            return;
        }
    }
}

fn skip_line(reader: &mut BufReader<&MemConn>) -> io::Result<()> {
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

fn write_frames(conn: &MemConn, mut rx: mpsc::Receiver<Bytes>) {
    let mut writer = conn;
    while let Some(frame) = rx.blocking_recv() {
        let written = writer
            .write_all(&frame)
            .and_then(|()| writer.write_all(b"\n"));
        if let Err(e) = written {
            if !conn.is_closed() {
                tracing::debug!(error = %e, "memconn write ended");
            }
            return;
        }
    }
    conn.shutdown_write();
}
