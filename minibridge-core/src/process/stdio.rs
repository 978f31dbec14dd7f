//! Stdio MCP server launcher.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{McpStream, ProcessExit, StreamEnds, StreamError};
use crate::framing::{FramingError, MAX_MESSAGE_BYTES, bounded_read_line, sanitize};

/// Placeholder in server environment values replaced by the working directory.
pub const PREFIX_PLACEHOLDER: &str = "_MINIBRIDGE_PREFIX_";

/// Time a server gets to exit after SIGINT before it is killed.
const SIGINT_GRACE: Duration = Duration::from_secs(5);

/// Credentials applied to the server process on Unix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub groups: Vec<u32>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.uid.is_none() && self.gid.is_none() && self.groups.is_empty()
    }
}

/// Launch description of an MCP server speaking newline-delimited JSON-RPC
/// on its standard streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StdioServer {
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment, layered over the parent environment.
    pub env: Vec<(String, String)>,
    /// Run the server in a fresh `minibridge-*` temp dir removed on cancel.
    pub use_tempdir: bool,
    pub credentials: Credentials,
}

impl StdioServer {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Spawns the server and returns its stream.
    ///
    /// The process lives until `cancel` fires (it then receives SIGINT) or it
    /// exits on its own. Exit is reported through
    /// [`McpStream::subscribe_exit`].
    pub fn start(&self, cancel: CancellationToken) -> Result<McpStream, StreamError> {
        let tempdir = if self.use_tempdir {
            Some(
                tempfile::Builder::new()
                    .prefix("minibridge-")
                    .tempdir()
                    .map_err(StreamError::TempDir)?,
            )
        } else {
            None
        };

        let dir = match &tempdir {
            Some(t) => t.path().to_path_buf(),
            None => std::env::current_dir().map_err(StreamError::CurrentDir)?,
        };

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env_clear()
            .envs(self.environment(&dir))
            .current_dir(&dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
            apply_credentials(&mut cmd, &self.credentials);
        }

        let mut child = cmd.spawn().map_err(|source| StreamError::Spawn {
            command: self.command.clone(),
            source,
        })?;

        tracing::info!(
            command = %self.command,
            pid = child.id(),
            dir = %dir.display(),
            "mcp server process spawned"
        );

        let (stream, ends) = McpStream::new(cancel.clone());
        let StreamEnds {
            stdin,
            stdout,
            stderr,
            exit,
        } = ends;

        if let Some(pipe) = child.stdin.take() {
            tokio::spawn(pump_stdin(pipe, stdin, cancel.clone()));
        }
        if let Some(pipe) = child.stdout.take() {
            tokio::spawn(pump_lines(BufReader::new(pipe), stdout, "stdout"));
        }
        if let Some(pipe) = child.stderr.take() {
            tokio::spawn(pump_lines(BufReader::new(pipe), stderr, "stderr"));
        }

        tokio::spawn(async move {
            let status = supervise(child, cancel).await;
            // Removing the temp dir only after the process is gone.
            drop(tempdir);
            let _ = exit.send(status);
        });

        Ok(stream)
    }

    /// Parent environment plus server environment, with the prefix
    /// placeholder replaced by `dir`.
    fn environment(&self, dir: &Path) -> Vec<(String, String)> {
        let prefix = dir.to_string_lossy();
        std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .chain(self.env.iter().cloned())
            .map(|(k, v)| {
                (
                    k.replace(PREFIX_PLACEHOLDER, &prefix),
                    v.replace(PREFIX_PLACEHOLDER, &prefix),
                )
            })
            .collect()
    }
}

#[cfg(unix)]
fn apply_credentials(cmd: &mut Command, creds: &Credentials) {
    use nix::unistd::{Gid, Uid, setgid, setgroups, setuid};

    if creds.is_empty() {
        return;
    }

    let groups: Vec<Gid> = creds.groups.iter().copied().map(Gid::from_raw).collect();
    let gid = creds.gid.map(Gid::from_raw);
    let uid = creds.uid.map(Uid::from_raw);

    // SAFETY: the closure runs between fork and exec and only issues the
    // setgroups/setgid/setuid syscalls on data allocated before the fork.
    // Groups and gid must be changed before uid drops the privilege to do so.
    unsafe {
        cmd.pre_exec(move || {
            if !groups.is_empty() {
                setgroups(&groups)?;
            }
            if let Some(gid) = gid {
                setgid(gid)?;
            }
            if let Some(uid) = uid {
                setuid(uid)?;
            }
            Ok(())
        });
    }
}

async fn pump_stdin(mut pipe: ChildStdin, mut rx: mpsc::Receiver<Bytes>, cancel: CancellationToken) {
    loop {
        let data = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            data = rx.recv() => match data {
                Some(data) => data,
                None => return,
            },
        };

        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.extend_from_slice(sanitize(&data));
        frame.push(b'\n');

        if let Err(e) = pipe.write_all(&frame).await {
            tracing::warn!(error = %e, "unable to write to mcp server stdin");
            return;
        }
        if let Err(e) = pipe.flush().await {
            tracing::warn!(error = %e, "unable to flush mcp server stdin");
            return;
        }
    }
}

async fn pump_lines<R>(mut reader: R, tx: mpsc::Sender<Bytes>, stream: &'static str)
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match bounded_read_line(&mut reader, &mut buf, MAX_MESSAGE_BYTES).await {
            Ok(0) => return,
            Ok(_) => {
                let line = Bytes::copy_from_slice(sanitize(&buf));
                if line.is_empty() {
                    continue;
                }
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            Err(FramingError::MessageTooLarge { max_bytes }) => {
                tracing::warn!(stream, max_bytes, "dropping oversized line from mcp server");
            }
            Err(FramingError::Io(e)) => {
                tracing::debug!(stream, error = %e, "mcp server pipe closed");
                return;
            }
        }
    }
}

async fn supervise(mut child: Child, cancel: CancellationToken) -> ProcessExit {
    tokio::select! {
        status = child.wait() => return to_exit(status),
        _ = cancel.cancelled() => {}
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            tracing::debug!(pid, "sending SIGINT to mcp server process group");
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGINT) {
                tracing::warn!(pid, error = ?e, "killpg SIGINT failed");
            }
        }
    }

    match tokio::time::timeout(SIGINT_GRACE, child.wait()).await {
        Ok(status) => to_exit(status),
        Err(_) => {
            tracing::warn!("mcp server did not exit after SIGINT, killing it");
            if let Err(e) = child.kill().await {
                tracing::error!(error = %e, "unable to kill mcp server");
            }
            to_exit(child.wait().await)
        }
    }
}

fn to_exit(status: std::io::Result<std::process::ExitStatus>) -> ProcessExit {
    match status {
        Ok(status) => ProcessExit::Exited {
            code: status.code(),
        },
        Err(e) => ProcessExit::WaitFailed {
            reason: e.to_string(),
        },
    }
}
