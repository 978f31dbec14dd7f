//! Subprocess message multiplexing.
//!
//! An [`McpStream`] fronts one MCP server process. Input goes through a single
//! stdin queue; stdout lines, stderr lines and the terminal exit status are
//! fanned out to every registered [`Subscription`]. Each subscriber owns a
//! small bounded queue: when it is full the line is dropped for that
//! subscriber only and an error is logged, so one slow reader never stalls
//! the pipe.
//!
//! The stream does not know how the process is run. [`StdioServer`] spawns a
//! real child and feeds the [`StreamEnds`]; tests can drive the ends directly.

mod stderr;
mod stdio;

pub use stderr::StderrRing;
pub use stdio::{Credentials, PREFIX_PLACEHOLDER, StdioServer};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::mcp::{McpCall, Notification, related_ids};

/// Capacity of each stdout/stderr subscriber queue.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 8;

/// Capacity of the shared stdin queue.
const STDIN_QUEUE_CAPACITY: usize = 16;

/// Capacity of the internal queues between pipe readers and the broadcaster.
const FEED_QUEUE_CAPACITY: usize = 16;

/// How long a cancelled stream waits for the real exit status before
/// synthesizing [`ProcessExit::Cancelled`].
const EXIT_GRACE: Duration = Duration::from_secs(1);

// ─────────────────────────────────────────────────────────────────────────────
// Errors and Exit Status
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by stream operations and process startup.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("unable to get current directory: {0}")]
    CurrentDir(#[source] std::io::Error),

    #[error("unable to create tempdir: {0}")]
    TempDir(#[source] std::io::Error),

    #[error("unable to start command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to encode mcp call: {0}")]
    Encode(#[from] serde_json::Error),

    /// The process side of the stream is gone.
    #[error("stream closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,
}

/// Terminal state of the server process, delivered once per subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process exited. `code` is `None` when it was killed by a signal.
    Exited { code: Option<i32> },
    /// Waiting on the process failed.
    WaitFailed { reason: String },
    /// The governing context was cancelled and no exit status arrived in time.
    Cancelled,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Exited { code: Some(0) })
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessExit::Exited { code: Some(code) } => write!(f, "exit status {code}"),
            ProcessExit::Exited { code: None } => write!(f, "terminated by signal"),
            ProcessExit::WaitFailed { reason } => write!(f, "wait failed: {reason}"),
            ProcessExit::Cancelled => write!(f, "context canceled"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscriber Registry
// ─────────────────────────────────────────────────────────────────────────────

struct Registry<T> {
    next_id: u64,
    senders: HashMap<u64, mpsc::Sender<T>>,
    /// Last value for latched registries (exit): replayed to late subscribers.
    latched: Option<T>,
    closed: bool,
}

impl<T: Clone> Registry<T> {
    fn new() -> Self {
        Self {
            next_id: 0,
            senders: HashMap::new(),
            latched: None,
            closed: false,
        }
    }

    fn fan_out(&self, value: &T, stream: &'static str) {
        for tx in self.senders.values() {
            if tx.try_send(value.clone()).is_err() {
                tracing::error!(stream, "{stream} message dropped for registered channel");
            }
        }
    }

    /// Delivers `value` to current subscribers, keeps it for late ones, and closes.
    fn latch(&mut self, value: T, stream: &'static str) {
        self.fan_out(&value, stream);
        self.latched = Some(value);
        self.close();
    }

    fn close(&mut self) {
        self.closed = true;
        self.senders.clear();
    }
}

/// A registered receiver of one of the stream's outputs.
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`])
/// removes it from the fan-out set.
pub struct Subscription<T: Clone> {
    rx: mpsc::Receiver<T>,
    id: u64,
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: Clone> Subscription<T> {
    fn register(registry: &Arc<Mutex<Registry<T>>>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let mut reg = registry.lock();
        let id = reg.next_id;
        reg.next_id += 1;

        if let Some(value) = reg.latched.clone() {
            // Capacity is at least 1, the send cannot fail.
            let _ = tx.try_send(value);
        }
        if !reg.closed {
            reg.senders.insert(id, tx);
        }

        Self {
            rx,
            id,
            registry: Arc::clone(registry),
        }
    }

    /// Receives the next value. Returns `None` once the stream has terminated
    /// and everything queued for this subscriber has been consumed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl<T: Clone> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.registry.lock().senders.remove(&self.id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream
// ─────────────────────────────────────────────────────────────────────────────

/// Process-side ends of a stream, consumed by whatever runs the server.
pub struct StreamEnds {
    /// Frames to write to the process stdin.
    pub stdin: mpsc::Receiver<Bytes>,
    /// Sanitized stdout lines.
    pub stdout: mpsc::Sender<Bytes>,
    /// Sanitized stderr lines.
    pub stderr: mpsc::Sender<Bytes>,
    /// Exit status, sent once.
    pub exit: oneshot::Sender<ProcessExit>,
}

/// Handle on a running MCP server's standard streams.
#[derive(Clone)]
pub struct McpStream {
    stdin: mpsc::Sender<Bytes>,
    stdout: Arc<Mutex<Registry<Bytes>>>,
    stderr: Arc<Mutex<Registry<Bytes>>>,
    exit: Arc<Mutex<Registry<ProcessExit>>>,
    cancel: CancellationToken,
}

#[derive(Deserialize)]
struct IdEnvelope {
    #[serde(default)]
    id: Option<Value>,
}

impl McpStream {
    /// Creates a stream and starts its broadcaster.
    ///
    /// Cancelling `cancel` terminates the broadcaster: exit subscribers receive
    /// the real exit status if it arrives within a short grace period, and
    /// [`ProcessExit::Cancelled`] otherwise.
    pub fn new(cancel: CancellationToken) -> (Self, StreamEnds) {
        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_QUEUE_CAPACITY);
        let (stdout_tx, stdout_rx) = mpsc::channel(FEED_QUEUE_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel(FEED_QUEUE_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        let stream = Self {
            stdin: stdin_tx,
            stdout: Arc::new(Mutex::new(Registry::new())),
            stderr: Arc::new(Mutex::new(Registry::new())),
            exit: Arc::new(Mutex::new(Registry::new())),
            cancel,
        };

        tokio::spawn(stream.clone().broadcast(stdout_rx, stderr_rx, exit_rx));

        let ends = StreamEnds {
            stdin: stdin_rx,
            stdout: stdout_tx,
            stderr: stderr_tx,
            exit: exit_tx,
        };

        (stream, ends)
    }

    /// Raw stdin queue. Frames are newline-terminated by the writer.
    pub fn stdin(&self) -> mpsc::Sender<Bytes> {
        self.stdin.clone()
    }

    pub fn subscribe_stdout(&self) -> Subscription<Bytes> {
        Subscription::register(&self.stdout, SUBSCRIBER_QUEUE_CAPACITY)
    }

    pub fn subscribe_stderr(&self) -> Subscription<Bytes> {
        Subscription::register(&self.stderr, SUBSCRIBER_QUEUE_CAPACITY)
    }

    pub fn subscribe_exit(&self) -> Subscription<ProcessExit> {
        Subscription::register(&self.exit, 1)
    }

    /// Token governing the stream's lifetime.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Enqueues raw bytes on stdin.
    pub async fn write(&self, cancel: &CancellationToken, data: Bytes) -> Result<(), StreamError> {
        tokio::select! {
            res = self.stdin.send(data) => res.map_err(|_| StreamError::Closed),
            _ = cancel.cancelled() => Err(StreamError::Cancelled),
            _ = self.cancel.cancelled() => Err(StreamError::Cancelled),
        }
    }

    /// Encodes and enqueues a call on stdin without waiting for a reply.
    pub async fn send(&self, cancel: &CancellationToken, call: &McpCall) -> Result<(), StreamError> {
        let data = call.encode()?;
        self.write(cancel, Bytes::from(data)).await
    }

    pub async fn send_notification(
        &self,
        cancel: &CancellationToken,
        notification: &Notification,
    ) -> Result<(), StreamError> {
        let data = serde_json::to_vec(notification)?;
        self.write(cancel, Bytes::from(data)).await
    }

    /// Sends `call` and waits for the response carrying a related id.
    ///
    /// A private stdout subscription is registered before the request is
    /// written so the reply cannot be consumed by another reader first.
    /// Unrelated and undecodable lines are skipped.
    pub async fn send_request(
        &self,
        cancel: &CancellationToken,
        call: &McpCall,
    ) -> Result<McpCall, StreamError> {
        let mut stdout = self.subscribe_stdout();
        self.send(cancel, call).await?;

        let request_id = call.id.clone().unwrap_or(Value::Null);

        loop {
            let line = tokio::select! {
                line = stdout.recv() => line.ok_or(StreamError::Closed)?,
                _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                _ = self.cancel.cancelled() => return Err(StreamError::Cancelled),
            };

            let envelope: IdEnvelope = match serde_json::from_slice(&line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping undecodable stdout line");
                    continue;
                }
            };

            let Some(id) = envelope.id else { continue };
            if !related_ids(&request_id, &id) {
                continue;
            }

            match McpCall::decode(&line) {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    tracing::debug!(error = %e, "skipping undecodable response");
                }
            }
        }
    }

    /// Repeats `call` following `result.nextCursor` until no cursor is
    /// returned, collecting every page. Follow-up pages reuse the original id
    /// and method with `params = {"cursor": <nextCursor>}`.
    pub async fn send_paginated_request(
        &self,
        cancel: &CancellationToken,
        call: &McpCall,
    ) -> Result<Vec<McpCall>, StreamError> {
        let mut pages = Vec::new();
        let mut current = call.clone();

        loop {
            let resp = self.send_request(cancel, &current).await?;
            let cursor = resp.next_cursor().map(str::to_string);
            pages.push(resp);

            let Some(cursor) = cursor else {
                return Ok(pages);
            };

            current = McpCall::new(call.id.clone());
            current.method = call.method.clone();
            let mut params = Map::new();
            params.insert("cursor".to_string(), Value::String(cursor));
            current.params = Some(params);
        }
    }

    async fn broadcast(
        self,
        mut stdout: mpsc::Receiver<Bytes>,
        mut stderr: mpsc::Receiver<Bytes>,
        mut exit: oneshot::Receiver<ProcessExit>,
    ) {
        let status = loop {
            tokio::select! {
                biased;
                Some(line) = stdout.recv() => self.stdout.lock().fan_out(&line, "stdout"),
                Some(line) = stderr.recv() => self.stderr.lock().fan_out(&line, "stderr"),
                status = &mut exit => {
                    break status.unwrap_or_else(|_| ProcessExit::WaitFailed {
                        reason: "process supervisor went away".to_string(),
                    });
                }
                _ = self.cancel.cancelled() => {
                    break match tokio::time::timeout(EXIT_GRACE, &mut exit).await {
                        Ok(Ok(status)) => status,
                        _ => ProcessExit::Cancelled,
                    };
                }
            }
        };

        // Flush output the process wrote before exiting.
        let drain = async {
            loop {
                tokio::select! {
                    Some(line) = stdout.recv() => self.stdout.lock().fan_out(&line, "stdout"),
                    Some(line) = stderr.recv() => self.stderr.lock().fan_out(&line, "stderr"),
                    else => break,
                }
            }
        };
        let _ = tokio::time::timeout(EXIT_GRACE, drain).await;

        tracing::debug!(exit = %status, "mcp server stream terminated");
        self.exit.lock().latch(status, "exit");
        self.stdout.lock().close();
        self.stderr.lock().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(v: serde_json::Value) -> Bytes {
        Bytes::from(serde_json::to_vec(&v).unwrap())
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_subscriber_in_order() {
        let (stream, ends) = McpStream::new(CancellationToken::new());
        let mut a = stream.subscribe_stdout();
        let mut b = stream.subscribe_stdout();

        ends.stdout.send(Bytes::from_static(b"one")).await.unwrap();
        ends.stdout.send(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), "one");
        assert_eq!(a.recv().await.unwrap(), "two");
        assert_eq!(b.recv().await.unwrap(), "one");
        assert_eq!(b.recv().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let (stream, ends) = McpStream::new(CancellationToken::new());
        let _stalled = stream.subscribe_stdout();
        let mut live = stream.subscribe_stdout();

        for i in 0..(SUBSCRIBER_QUEUE_CAPACITY * 3) {
            ends.stdout.send(Bytes::from(i.to_string())).await.unwrap();
            assert_eq!(live.recv().await.unwrap(), i.to_string());
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_from_fan_out() {
        let (stream, _ends) = McpStream::new(CancellationToken::new());
        let sub = stream.subscribe_stdout();
        assert_eq!(stream.stdout.lock().senders.len(), 1);
        sub.unsubscribe();
        assert_eq!(stream.stdout.lock().senders.len(), 0);
    }

    #[tokio::test]
    async fn test_exit_delivered_once_and_replayed_to_late_subscribers() {
        let (stream, ends) = McpStream::new(CancellationToken::new());
        let mut early = stream.subscribe_exit();

        ends.exit.send(ProcessExit::Exited { code: Some(3) }).unwrap();
        drop(ends.stdout);
        drop(ends.stderr);

        assert_eq!(
            early.recv().await,
            Some(ProcessExit::Exited { code: Some(3) })
        );
        assert_eq!(early.recv().await, None);

        let mut late = stream.subscribe_exit();
        assert_eq!(late.recv().await, Some(ProcessExit::Exited { code: Some(3) }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_synthesizes_exit_after_grace() {
        let cancel = CancellationToken::new();
        let (stream, _ends) = McpStream::new(cancel.clone());
        let mut exit = stream.subscribe_exit();

        cancel.cancel();
        assert_eq!(exit.recv().await, Some(ProcessExit::Cancelled));
    }

    #[tokio::test]
    async fn test_send_request_skips_unrelated_ids() {
        let (stream, mut ends) = McpStream::new(CancellationToken::new());

        let server = tokio::spawn(async move {
            let req = ends.stdin.recv().await.unwrap();
            let req: serde_json::Value = serde_json::from_slice(&req).unwrap();
            assert_eq!(req["method"], "tools/list");

            ends.stdout.send(Bytes::from_static(b"not json")).await.unwrap();
            ends.stdout
                .send(line(json!({"jsonrpc": "2.0", "id": "2", "result": {}})))
                .await
                .unwrap();
            ends.stdout
                .send(line(json!({"jsonrpc": "2.0", "id": 2.0, "result": {"ok": true}})))
                .await
                .unwrap();
            ends
        });

        let resp = stream
            .send_request(&CancellationToken::new(), &McpCall::request(2, "tools/list"))
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_request_cancelled() {
        let (stream, _ends) = McpStream::new(CancellationToken::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = stream
            .send_request(&cancel, &McpCall::request(1, "ping"))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Cancelled));
    }

    #[tokio::test]
    async fn test_send_paginated_request_follows_cursor() {
        let (stream, mut ends) = McpStream::new(CancellationToken::new());

        let server = tokio::spawn(async move {
            let first: serde_json::Value =
                serde_json::from_slice(&ends.stdin.recv().await.unwrap()).unwrap();
            assert!(first.get("params").is_none());
            ends.stdout
                .send(line(json!({"jsonrpc": "2.0", "id": 7, "result": {"tools": [], "nextCursor": "p2"}})))
                .await
                .unwrap();

            let second: serde_json::Value =
                serde_json::from_slice(&ends.stdin.recv().await.unwrap()).unwrap();
            assert_eq!(second["id"], 7);
            assert_eq!(second["method"], "tools/list");
            assert_eq!(second["params"]["cursor"], "p2");
            ends.stdout
                .send(line(json!({"jsonrpc": "2.0", "id": 7, "result": {"tools": []}})))
                .await
                .unwrap();
            ends
        });

        let pages = stream
            .send_paginated_request(&CancellationToken::new(), &McpCall::request(7, "tools/list"))
            .await
            .unwrap();
        assert_eq!(pages.len(), 2);
        server.await.unwrap();
    }
}
