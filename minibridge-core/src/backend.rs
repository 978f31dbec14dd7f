//! Backend pump: joins one agent connection to a running MCP server.
//!
//! Agent frames are policed as requests and written to the server's stdin.
//! Server stdout lines are policed as responses and written to the agent.
//! Rejections always go back to the agent. The server's stderr is kept in a
//! [`StderrRing`] and surfaced when the pump ends.

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::identity::Agent;
use crate::mcp::normalize_id;
use crate::pipeline::{Outcome, Pipeline};
use crate::policer::CallType;
use crate::process::{McpStream, ProcessExit, StderrRing};

/// How long replies to requests still in flight are awaited once the agent
/// has closed its side.
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Agent side of a backend connection.
pub struct AgentFrames {
    /// Frames sent by the agent.
    pub inbound: mpsc::Receiver<Bytes>,
    /// Frames addressed to the agent.
    pub outbound: mpsc::Sender<Bytes>,
}

/// Per-connection settings of [`run_backend`].
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Identity attached to every policer request.
    pub agent: Agent,

    /// Write the server's stderr tail to our stderr instead of the log.
    pub dump_stderr: bool,

    /// Wait for replies in flight after the agent disconnects. Zero ends the
    /// pump as soon as the agent is gone.
    pub drain_grace: Duration,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            agent: Agent::default(),
            dump_stderr: false,
            drain_grace: DRAIN_GRACE,
        }
    }
}

/// Why [`run_backend`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendExit {
    /// The server process terminated.
    Process(ProcessExit),
    /// The agent closed its side of the connection.
    AgentDisconnected,
    /// The governing token was cancelled.
    Cancelled,
}

impl std::fmt::Display for BackendExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendExit::Process(exit) => write!(f, "mcp server exited: {exit}"),
            BackendExit::AgentDisconnected => write!(f, "agent disconnected"),
            BackendExit::Cancelled => write!(f, "context canceled"),
        }
    }
}

/// Pumps frames between `frames` and `stream` until one side goes away.
///
/// When the agent closes its side, requests already forwarded keep their
/// chance to be answered: the pump stops reading from the agent and returns
/// once every one of them got a reply, the server exits, or the drain grace
/// period elapses.
pub async fn run_backend(
    cancel: &CancellationToken,
    frames: AgentFrames,
    stream: &McpStream,
    pipeline: &Pipeline,
    options: &BackendOptions,
) -> BackendExit {
    let AgentFrames {
        mut inbound,
        outbound,
    } = frames;

    // Subscribe before the first write so no reply can be missed.
    let mut stdout = stream.subscribe_stdout();
    let mut stderr = stream.subscribe_stderr();
    let mut exit = stream.subscribe_exit();
    let mut ring = StderrRing::default();
    let mut in_flight = InFlight::default();

    let mut agent_open = true;
    let drain = tokio::time::sleep(Duration::MAX);
    tokio::pin!(drain);

    let reason = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break BackendExit::Cancelled,

            Some(line) = stdout.recv() => {
                in_flight.answered(&line);
                let outcome = pipeline.police(CallType::Response, &options.agent, &line).await;
                if !deliver_response(&outbound, outcome).await {
                    break BackendExit::AgentDisconnected;
                }
                if !agent_open && in_flight.is_empty() {
                    break BackendExit::AgentDisconnected;
                }
            }

            Some(line) = stderr.recv() => {
                tracing::debug!(line = %String::from_utf8_lossy(&line), "mcp server stderr");
                ring.push_line(&line);
            }

            status = exit.recv() => {
                let status = status.unwrap_or(ProcessExit::Cancelled);

                while let Some(line) = stdout.try_recv() {
                    let outcome = pipeline.police(CallType::Response, &options.agent, &line).await;
                    if !deliver_response(&outbound, outcome).await {
                        break;
                    }
                }
                while let Some(line) = stderr.try_recv() {
                    ring.push_line(&line);
                }

                break BackendExit::Process(status);
            }

            _ = &mut drain, if !agent_open => {
                tracing::warn!(
                    pending = in_flight.len(),
                    "agent gone, giving up on replies in flight"
                );
                break BackendExit::AgentDisconnected;
            }

            frame = inbound.recv(), if agent_open => {
                let Some(frame) = frame else {
                    agent_open = false;
                    if in_flight.is_empty() || options.drain_grace.is_zero() {
                        break BackendExit::AgentDisconnected;
                    }
                    tracing::debug!(
                        pending = in_flight.len(),
                        "agent closed its side, waiting for replies in flight"
                    );
                    drain.as_mut().reset(tokio::time::Instant::now() + options.drain_grace);
                    continue;
                };
                match pipeline.police(CallType::Request, &options.agent, &frame).await {
                    Outcome::Forward(data) => {
                        in_flight.sent(&data);
                        if let Err(e) = stream.write(cancel, data).await {
                            tracing::error!(error = %e, "unable to write to mcp server stdin");
                        }
                    }
                    Outcome::Reject(data) => {
                        if outbound.send(data).await.is_err() {
                            break BackendExit::AgentDisconnected;
                        }
                    }
                    Outcome::Drop => {}
                }
            }
        }
    };

    tracing::info!(reason = %reason, "backend connection closed");
    surface_stderr(&ring, options.dump_stderr).await;
    reason
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
}

/// Ids of requests forwarded to the server and not answered yet.
#[derive(Default)]
struct InFlight(HashSet<String>);

impl InFlight {
    fn sent(&mut self, frame: &[u8]) {
        if let Ok(Envelope {
            id: Some(id),
            method: Some(_),
        }) = serde_json::from_slice(frame)
        {
            self.0.insert(normalize_id(&id));
        }
    }

    fn answered(&mut self, frame: &[u8]) {
        if let Ok(Envelope {
            id: Some(id),
            method: None,
        }) = serde_json::from_slice(frame)
        {
            self.0.remove(&normalize_id(&id));
        }
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Sends a policed server frame to the agent. Returns false when the agent is gone.
async fn deliver_response(outbound: &mpsc::Sender<Bytes>, outcome: Outcome) -> bool {
    match outcome {
        Outcome::Forward(data) | Outcome::Reject(data) => outbound.send(data).await.is_ok(),
        Outcome::Drop => true,
    }
}

async fn surface_stderr(ring: &StderrRing, dump: bool) {
    if ring.is_empty() {
        return;
    }

    let contents = ring.contents();
    if !dump {
        tracing::warn!(stderr = %contents, "mcp server stderr");
        return;
    }

    let framed = format!("---\n{}\n---\n", contents.trim_end());
    if let Err(e) = tokio::io::stderr().write_all(framed.as_bytes()).await {
        tracing::error!(error = %e, "unable to dump mcp server stderr");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineOptions;
    use crate::process::StreamEnds;
    use std::time::Duration;

    struct Harness {
        ends: StreamEnds,
        to_bridge: mpsc::Sender<Bytes>,
        from_bridge: mpsc::Receiver<Bytes>,
        task: tokio::task::JoinHandle<BackendExit>,
        cancel: CancellationToken,
    }

    fn harness() -> Harness {
        let cancel = CancellationToken::new();
        let (stream, ends) = McpStream::new(cancel.clone());
        let (to_bridge, inbound) = mpsc::channel(8);
        let (outbound, from_bridge) = mpsc::channel(8);

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let pipeline = Pipeline::new(PipelineOptions::default());
            run_backend(
                &token,
                AgentFrames { inbound, outbound },
                &stream,
                &pipeline,
                &BackendOptions::default(),
            )
            .await
        });

        Harness {
            ends,
            to_bridge,
            from_bridge,
            task,
            cancel,
        }
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let mut h = harness();

        let request = Bytes::from_static(br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#);
        h.to_bridge.send(request.clone()).await.unwrap();
        assert_eq!(h.ends.stdin.recv().await.unwrap(), request);

        let reply = Bytes::from_static(br#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
        h.ends.stdout.send(reply.clone()).await.unwrap();
        assert_eq!(h.from_bridge.recv().await.unwrap(), reply);

        h.cancel.cancel();
        assert_eq!(h.task.await.unwrap(), BackendExit::Cancelled);
    }

    #[tokio::test]
    async fn test_undecodable_request_is_answered_locally() {
        let mut h = harness();

        h.to_bridge.send(Bytes::from_static(b"not json")).await.unwrap();
        let reply: serde_json::Value =
            serde_json::from_slice(&h.from_bridge.recv().await.unwrap()).unwrap();
        assert_eq!(reply["error"]["code"], 500);
        assert!(h.ends.stdin.try_recv().is_err());

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_agent_disconnect_ends_pump() {
        let h = harness();
        drop(h.to_bridge);
        assert_eq!(h.task.await.unwrap(), BackendExit::AgentDisconnected);
    }

    #[tokio::test]
    async fn test_reply_in_flight_reaches_agent_after_disconnect() {
        let mut h = harness();

        let request = Bytes::from_static(br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#);
        h.to_bridge.send(request.clone()).await.unwrap();
        assert_eq!(h.ends.stdin.recv().await.unwrap(), request);
        drop(h.to_bridge);

        let reply = Bytes::from_static(br#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
        h.ends.stdout.send(reply.clone()).await.unwrap();
        assert_eq!(h.from_bridge.recv().await.unwrap(), reply);

        let reason = tokio::time::timeout(Duration::from_secs(1), h.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, BackendExit::AgentDisconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_gives_up_after_grace() {
        let mut h = harness();

        let request = Bytes::from_static(br#"{"jsonrpc":"2.0","id":"a","method":"ping"}"#);
        h.to_bridge.send(request).await.unwrap();
        h.ends.stdin.recv().await.unwrap();
        drop(h.to_bridge);

        tokio::time::sleep(DRAIN_GRACE / 2).await;
        assert!(!h.task.is_finished());

        let reason = tokio::time::timeout(DRAIN_GRACE, h.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, BackendExit::AgentDisconnected);
    }

    #[test]
    fn test_in_flight_tracks_requests_only() {
        let mut f = InFlight::default();
        f.sent(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#);
        assert!(f.is_empty());

        f.sent(br#"{"jsonrpc":"2.0","id":7,"method":"tools/call"}"#);
        f.answered(br#"{"jsonrpc":"2.0","id":8,"result":{}}"#);
        assert_eq!(f.len(), 1);

        f.answered(br#"{"jsonrpc":"2.0","id":7.0,"result":{}}"#);
        assert!(f.is_empty());
    }

    #[tokio::test]
    async fn test_process_exit_ends_pump() {
        let h = harness();
        let StreamEnds {
            stdout,
            stderr,
            exit,
            stdin: _stdin,
        } = h.ends;

        stderr.send(Bytes::from_static(b"boom")).await.unwrap();
        drop(stdout);
        drop(stderr);
        exit.send(ProcessExit::Exited { code: Some(1) }).unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, BackendExit::Process(ProcessExit::Exited { code: Some(1) }));
        assert_eq!(reason.to_string(), "mcp server exited: exit status 1");
    }
}
