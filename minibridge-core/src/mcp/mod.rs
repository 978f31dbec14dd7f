//! MCP JSON-RPC envelope model.
//!
//! Every frame crossing the bridge is decoded into an [`McpCall`]: requests,
//! notifications and responses share one shape and are told apart by which
//! fields are present. Ids are kept as raw JSON values so a frame re-encodes
//! with the exact id the peer sent; use [`related_ids`] to compare them.
//!
//! Fields are declared in alphabetical order so that the serialized form has
//! stable, sorted keys (`error`, `id`, `jsonrpc`, `method`, `params`, `result`).

mod id;
mod types;

pub use id::{normalize_id, related_ids};
pub use types::{Prompt, PromptArgument, Resource, ResourceTemplate, Tool};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON-RPC version string carried by every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Error code used when a frame is blocked by the manifest check or a policer.
pub const ERROR_CODE_BLOCKED: i64 = 451;

/// Error code used when a frame cannot be decoded.
pub const ERROR_CODE_DECODE: i64 = 500;

// ─────────────────────────────────────────────────────────────────────────────
// Protocol Versions
// ─────────────────────────────────────────────────────────────────────────────

/// MCP protocol revisions the bridge can announce in `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V2024_11_05,
    V2025_03_26,
}

impl ProtocolVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V2024_11_05 => "2024-11-05",
            ProtocolVersion::V2025_03_26 => "2025-03-26",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope Types
// ─────────────────────────────────────────────────────────────────────────────

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpError {
    pub code: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A JSON-RPC 2.0 MCP frame: request, notification or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
}

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

/// A JSON-RPC notification (no id, no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,

    pub method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

impl Notification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: None,
        }
    }
}

/// Errors produced while decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unable to decode mcp call: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame has no id, no method and neither result nor error.
    #[error("unable to decode mcp call: frame carries no id, method, result or error")]
    Malformed,
}

impl McpCall {
    /// Creates an empty call with the given id.
    pub fn new(id: Option<Value>) -> Self {
        Self {
            error: None,
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: None,
            params: None,
            result: None,
        }
    }

    /// Creates a request with the given id and method.
    pub fn request(id: impl Into<Value>, method: impl Into<String>) -> Self {
        let mut call = Self::new(Some(id.into()));
        call.method = Some(method.into());
        call
    }

    /// Creates an error response addressed to `id`.
    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        let mut call = Self::new(id);
        call.error = Some(McpError {
            code,
            message: message.into(),
            data: None,
        });
        call
    }

    /// Builds the `initialize` request the bridge sends when it drives a server itself.
    pub fn init(version: ProtocolVersion) -> Self {
        let params = serde_json::json!({
            "protocolVersion": version.as_str(),
            "capabilities": {
                "sampling": {},
                "roots": { "listChanged": true },
            },
            "clientInfo": {
                "name": "minibridge",
                "version": "1.0",
            },
        });

        let mut call = Self::request(0, "initialize");
        if let Value::Object(map) = params {
            call.params = Some(map);
        }
        call
    }

    /// Decodes a frame, rejecting envelopes that carry nothing routable.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let call: McpCall = serde_json::from_slice(data)?;
        if call.id.is_none()
            && call.method.is_none()
            && call.result.is_none()
            && call.error.is_none()
        {
            return Err(DecodeError::Malformed);
        }
        Ok(call)
    }

    /// Encodes the call as compact JSON.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Canonical string form of the id, or an empty string for notifications.
    pub fn id_string(&self) -> String {
        self.id.as_ref().map(normalize_id).unwrap_or_default()
    }

    /// True when the frame is a notification (method without id).
    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }

    /// True when the frame is a response (result or error).
    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    /// Returns the `result.nextCursor` string used for pagination, if any.
    pub fn next_cursor(&self) -> Option<&str> {
        self.result
            .as_ref()?
            .get("nextCursor")?
            .as_str()
            .filter(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blocked_error_serialization_is_sorted() {
        let call = McpCall::error(
            Some(json!(2)),
            ERROR_CODE_BLOCKED,
            "request blocked: you can't do that, Dave",
        );
        let encoded = String::from_utf8(call.encode().unwrap()).unwrap();
        assert_eq!(
            encoded,
            r#"{"error":{"code":451,"message":"request blocked: you can't do that, Dave"},"id":2,"jsonrpc":"2.0"}"#
        );
    }

    #[test]
    fn test_decode_error_without_id() {
        let call = McpCall::error(None, ERROR_CODE_DECODE, "boom");
        let encoded = String::from_utf8(call.encode().unwrap()).unwrap();
        assert_eq!(
            encoded,
            r#"{"error":{"code":500,"message":"boom"},"jsonrpc":"2.0"}"#
        );
    }

    #[test]
    fn test_decode_keeps_raw_id() {
        let call = McpCall::decode(br#"{"jsonrpc":"2.0","id":"abc","method":"ping"}"#).unwrap();
        assert_eq!(call.id, Some(json!("abc")));
        assert_eq!(call.method.as_deref(), Some("ping"));
        assert!(!call.is_notification());
    }

    #[test]
    fn test_decode_rejects_empty_envelope() {
        let err = McpCall::decode(br#"{"jsonrpc":"2.0"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed));
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        let err = McpCall::decode(b"{not json").unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn test_decode_id_only_is_accepted() {
        let call = McpCall::decode(br#"{"jsonrpc":"2.0","id":2}"#).unwrap();
        assert_eq!(call.id_string(), "2");
    }

    #[test]
    fn test_init_message() {
        let call = McpCall::init(ProtocolVersion::V2025_03_26);
        let params = call.params.unwrap();
        assert_eq!(call.method.as_deref(), Some("initialize"));
        assert_eq!(call.id, Some(json!(0)));
        assert_eq!(params["protocolVersion"], "2025-03-26");
        assert_eq!(params["clientInfo"]["name"], "minibridge");
        assert_eq!(params["capabilities"]["roots"]["listChanged"], true);
    }

    #[test]
    fn test_notification_serialization() {
        let n = Notification::new("notifications/initialized");
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(
            v,
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"})
        );
    }

    #[test]
    fn test_next_cursor() {
        let call =
            McpCall::decode(br#"{"jsonrpc":"2.0","id":1,"result":{"nextCursor":"p2"}}"#).unwrap();
        assert_eq!(call.next_cursor(), Some("p2"));

        let last =
            McpCall::decode(br#"{"jsonrpc":"2.0","id":1,"result":{"nextCursor":""}}"#).unwrap();
        assert_eq!(last.next_cursor(), None);
    }
}
