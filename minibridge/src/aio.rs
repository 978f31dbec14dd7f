//! `minibridge aio`: all-in-one stdio bridge.
//!
//! Our stdin is the agent side; every line read is a frame. Frames going to
//! the agent are written to stdout, one per line. The server runs as a child
//! process and everything in between goes through the policing pipeline.
//!
//! The agent side and the backend pump meet over an in-memory connection:
//! the pump accepts on a [`Listener`], the agent side dials it and drives the
//! connection through a registered [`Session`], the same way a network
//! frontend would.

use std::sync::Arc;

use bytes::Bytes;
use minibridge_core::backend::{AgentFrames, BackendExit, BackendOptions, DRAIN_GRACE, run_backend};
use minibridge_core::framing::{FramingError, MAX_MESSAGE_BYTES, bounded_read_line, sanitize};
use minibridge_core::identity::{Agent, IdentityFingerprint};
use minibridge_core::memconn::{FramedConn, Listener, MemConn};
use minibridge_core::pipeline::Pipeline;
use minibridge_core::process::{McpStream, ProcessExit};
use minibridge_core::session::{
    Session, SessionConn, SessionManager, SessionOptions, new_session_id,
};
use minibridge_core::telemetry::init_telemetry;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cli::AioArgs;
use crate::error::CliError;

/// Capacity of the queue between stdin and the session.
const AGENT_QUEUE_CAPACITY: usize = 16;

/// Capacity of the session hook feeding stdout. Hooks skip frames when
/// full, so this absorbs bursts while stdout catches up.
const HOOK_QUEUE_CAPACITY: usize = 1024;

/// Exit code reported when the bridge is interrupted.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Runs the bridge until the agent or the server goes away. Returns the
/// process exit code.
pub async fn run_aio(args: AioArgs) -> Result<i32, CliError> {
    let config = args.to_config()?;
    config.validate()?;

    let telemetry = init_telemetry(&config.telemetry_config());
    let server = config.stdio_server()?;
    let pipeline = Pipeline::new(config.pipeline_options()?);

    tracing::info!(
        command = %server.command,
        args = ?server.args,
        enforce = config.enforce,
        pipeline = ?pipeline.options(),
        "starting bridge"
    );

    let cancel = CancellationToken::new();
    let stream = server.start(cancel.clone())?;

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted");
            ctrl_c.cancel();
        }
    });

    let options = BackendOptions {
        agent: Agent::default(),
        dump_stderr: config.dump_stderr,
        ..BackendOptions::default()
    };
    let reason = splice(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        &stream,
        &pipeline,
        &options,
        &cancel,
    )
    .await;

    // Stops the server if it is still running.
    cancel.cancel();

    if let Err(e) = telemetry.shutdown() {
        tracing::warn!(error = %e, "telemetry shutdown failed");
    }

    Ok(exit_code(&reason?))
}

/// Bridges an agent speaking newline-delimited frames on `agent_in` and
/// `agent_out` to the server behind `stream`.
///
/// Returns once the backend pump stops and every reply it produced has been
/// written to `agent_out`.
pub async fn splice<R, W>(
    agent_in: R,
    agent_out: W,
    stream: &McpStream,
    pipeline: &Pipeline,
    options: &BackendOptions,
    cancel: &CancellationToken,
) -> Result<BackendExit, CliError>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (backend, agent) = connect().await?;

    let backend = FramedConn::new(backend)?;
    let backend_conn = Arc::clone(&backend.conn);
    let frames = AgentFrames {
        inbound: backend.inbound,
        outbound: backend.outbound,
    };

    let manager = SessionManager::new();
    let session = open_session(&manager, FramedConn::new(agent)?);
    let sid = session.id().to_string();

    let (hook, from_session) = mpsc::channel(HOOK_QUEUE_CAPACITY);
    let identity = IdentityFingerprint::compute(None, &[]);
    let session = manager.acquire_for(&sid, identity, Some(hook.clone()))?;
    let writer = tokio::spawn(write_frames(agent_out, from_session));

    let (to_session, agent_frames) = mpsc::channel(AGENT_QUEUE_CAPACITY);
    let reader = tokio::spawn(read_frames(agent_in, to_session, cancel.clone()));
    let forwarder = tokio::spawn(forward_to_session(agent_frames, Arc::clone(&session)));

    let reason = run_backend(cancel, frames, stream, pipeline, options).await;

    // The pump dropped its end: the agent side reads what is left, then EOF.
    if tokio::time::timeout(DRAIN_GRACE, session.closed()).await.is_err() {
        tracing::warn!(sid = %sid, "agent side did not drain in time");
    }
    manager.release(&sid, Some(&hook));
    drop(hook);
    session.close();
    backend_conn.close();

    reader.abort();
    forwarder.abort();
    if let Err(e) = writer.await {
        tracing::error!(error = %e, "stdout writer failed");
    }

    Ok(reason)
}

/// Opens a listener and returns both ends of one connection through it:
/// the accepted backend end first.
async fn connect() -> std::io::Result<(MemConn, MemConn)> {
    let listener = Arc::new(Listener::new());

    let accepting = Arc::clone(&listener);
    let accept = tokio::task::spawn_blocking(move || accepting.accept());
    let dialing = Arc::clone(&listener);
    let dial = tokio::task::spawn_blocking(move || dialing.dial("agent"));

    let backend = accept.await.map_err(std::io::Error::other)??;
    let agent = dial.await.map_err(std::io::Error::other)??;

    if let Err(e) = listener.close() {
        tracing::debug!(error = %e, "listener already closed");
    }
    Ok((backend, agent))
}

/// Registers a session over the agent end of the connection. Closing the
/// session closes the connection.
fn open_session(manager: &SessionManager, agent: FramedConn) -> Arc<Session> {
    let close = CancellationToken::new();

    let conn = Arc::clone(&agent.conn);
    let closed = close.clone();
    tokio::spawn(async move {
        closed.cancelled().await;
        conn.close();
    });

    let session = Session::new(
        new_session_id(),
        IdentityFingerprint::compute(None, &[]),
        SessionConn {
            outbound: agent.outbound,
            inbound: agent.inbound,
            close,
        },
        SessionOptions::default(),
    );
    manager.register(Arc::clone(&session));
    tracing::debug!(sid = %session.id(), "bridge session opened");
    session
}

/// Writes agent frames into the session, then ends its writes so the
/// backend sees end of input.
async fn forward_to_session(mut frames: mpsc::Receiver<Bytes>, session: Arc<Session>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = session.write(frame).await {
            tracing::debug!(error = %e, "agent frame not forwarded");
            break;
        }
    }
    session.end_writes();
}

/// Maps why the bridge stopped to our exit code.
pub fn exit_code(reason: &BackendExit) -> i32 {
    match reason {
        BackendExit::Process(ProcessExit::Exited { code: Some(code) }) => *code,
        BackendExit::Process(_) => 1,
        BackendExit::AgentDisconnected => 0,
        BackendExit::Cancelled => INTERRUPTED_EXIT_CODE,
    }
}

/// Reads newline-delimited frames from `reader` until EOF or cancellation.
///
/// Blank lines are skipped. Oversized lines are discarded with a warning.
pub async fn read_frames<R: AsyncBufRead + Unpin>(
    mut reader: R,
    frames: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            read = bounded_read_line(&mut reader, &mut buf, MAX_MESSAGE_BYTES) => read,
        };

        match read {
            Ok(0) => {
                tracing::debug!("agent closed stdin");
                return;
            }
            Ok(_) => {}
            Err(FramingError::MessageTooLarge { max_bytes }) => {
                tracing::warn!(max_bytes, "discarding oversized frame from agent");
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "unable to read from stdin");
                return;
            }
        }

        let frame = sanitize(&buf);
        if frame.is_empty() {
            continue;
        }
        if frames.send(Bytes::copy_from_slice(frame)).await.is_err() {
            return;
        }
    }
}

/// Writes every frame from `frames` to `writer`, newline-terminated.
pub async fn write_frames<W: AsyncWrite + Unpin>(mut writer: W, mut frames: mpsc::Receiver<Bytes>) {
    while let Some(frame) = frames.recv().await {
        let result = async {
            writer.write_all(sanitize(&frame)).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "unable to write to stdout");
            return;
        }
    }
}
