//! Session identifiers and the SSE framing that carries them to agents.

use crate::framing::sanitize;

/// HTTP header carrying the session id on the streamable transport.
pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// Generates a fresh random session id.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// The `endpoint` event telling an SSE agent where to post its messages.
pub fn sse_endpoint_event(messages_endpoint: &str, sid: &str) -> String {
    format!("event: endpoint\ndata: {messages_endpoint}?sessionId={sid}\n\n")
}

/// Wraps one JSON-RPC frame as an SSE `message` event.
pub fn sse_message_event(data: &[u8]) -> String {
    format!(
        "event: message\ndata: {}\n\n",
        String::from_utf8_lossy(sanitize(data))
    )
}
