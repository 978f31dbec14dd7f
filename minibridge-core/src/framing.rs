//! Newline-delimited framing helpers.
//!
//! MCP servers speak one JSON-RPC message per line on their standard streams.
//! Lines are trimmed of trailing `\n`/`\r` before they enter the bridge and
//! re-terminated on the way out. Agent-facing message transports expect each
//! frame to end with a blank line, see [`terminate_frame`].

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Maximum size of a single line (10 MB).
///
/// Lines exceeding this limit are drained and rejected before any JSON parsing
/// so a peer streaming bytes without a newline cannot grow the buffer without
/// bound.
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// Upper bound on the time spent discarding the tail of an oversized line.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised while reading framed lines.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// A single line exceeds the configured maximum size.
    #[error("message exceeds maximum size of {max_bytes} bytes")]
    MessageTooLarge { max_bytes: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Removes every trailing `\n` and `\r` from `data`.
pub fn sanitize(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|&b| b != b'\n' && b != b'\r')
        .map_or(0, |pos| pos + 1);
    &data[..end]
}

/// Ensures `data` ends with exactly the `\n\n` frame terminator.
///
/// Frames already ending with `\n\n` are returned unchanged; a single trailing
/// newline is doubled.
pub fn terminate_frame(mut data: Vec<u8>) -> Vec<u8> {
    if data.ends_with(b"\n\n") {
        return data;
    }
    if data.ends_with(b"\n") {
        data.push(b'\n');
        return data;
    }
    data.extend_from_slice(b"\n\n");
    data
}

/// Read a single line from an async buffered reader, enforcing a byte limit.
///
/// Raw bytes are accumulated into `buf` (newline included) so multi-byte UTF-8
/// sequences straddling internal buffer boundaries are never split.
///
/// # Returns
///
/// - `Ok(n)` where `n > 0`: a complete line (or the final unterminated line) was read
/// - `Ok(0)`: EOF reached
/// - `Err(FramingError::MessageTooLarge)`: line exceeded `max_bytes`; the rest of
///   the line has been discarded and the reader is positioned on the next line
pub async fn bounded_read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<usize, FramingError> {
    let mut total = 0usize;
    loop {
        let available = reader.fill_buf().await?;

        if available.is_empty() {
            return Ok(total);
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let to_consume = pos + 1;
                if total + to_consume > max_bytes {
                    reader.consume(to_consume);
                    return Err(FramingError::MessageTooLarge { max_bytes });
                }

                buf.extend_from_slice(&available[..to_consume]);
                total += to_consume;
                reader.consume(to_consume);
                return Ok(total);
            }
            None => {
                let len = available.len();
                if total + len > max_bytes {
                    reader.consume(len);
                    drain_until_newline(reader).await;
                    return Err(FramingError::MessageTooLarge { max_bytes });
                }

                buf.extend_from_slice(available);
                total += len;
                reader.consume(len);
            }
        }
    }
}

async fn drain_until_newline<R: AsyncBufRead + Unpin>(reader: &mut R) {
    let drain = async {
        loop {
            match reader.fill_buf().await {
                Ok([]) => return,
                Ok(buf) => {
                    if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        reader.consume(pos + 1);
                        return;
                    }
                    let len = buf.len();
                    reader.consume(len);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "io error while draining oversized line");
                    return;
                }
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("drain of oversized line timed out");
    }
}
