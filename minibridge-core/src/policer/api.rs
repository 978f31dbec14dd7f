//! Wire types exchanged with policers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::Agent;
use crate::mcp::McpCall;

/// Direction of the policed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Agent to server.
    Request,
    /// Server to agent.
    Response,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Request => "request",
            CallType::Response => "response",
        }
    }
}

/// Trace identifiers of the span covering the policed frame. Carried for
/// correlation in the decision service only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanContext {
    #[serde(rename = "traceId")]
    pub trace_id: String,

    #[serde(rename = "spanId")]
    pub span_id: String,

    #[serde(rename = "parentSpanId", default, skip_serializing_if = "String::is_empty")]
    pub parent_span_id: String,

    pub name: String,

    pub start: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// Input of a policer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub call_type: CallType,

    pub mcp: McpCall,

    #[serde(default)]
    pub agent: Agent,

    #[serde(rename = "spanContext", default, skip_serializing_if = "Option::is_none")]
    pub span_context: Option<SpanContext>,
}

impl Request {
    pub fn new(call_type: CallType, mcp: McpCall, agent: Agent) -> Self {
        Self {
            call_type,
            mcp,
            agent,
            span_context: None,
        }
    }
}

/// Decision returned by a remote policer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub allow: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,

    /// Replacement for the policed call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp: Option<McpCall>,
}

impl Response {
    pub fn allow() -> Self {
        Self {
            allow: true,
            ..Self::default()
        }
    }

    pub fn deny<I, S>(reasons: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow: false,
            reasons: reasons.into_iter().map(Into::into).collect(),
            mcp: None,
        }
    }
}
