//! MCP span instrumentation.
//!
//! Spans are named after the JSON-RPC method (or `response` for replies) and
//! carry the attributes below. Tool arguments are never recorded.

use opentelemetry::{
    Context, KeyValue,
    global::{self, BoxedSpan},
    trace::{Span, SpanKind, Status, Tracer},
};

use crate::mcp::McpCall;

// ─────────────────────────────────────────────────────────────────────────────
// Attribute Names
// ─────────────────────────────────────────────────────────────────────────────

/// JSON-RPC method name (e.g. "tools/call").
pub const MCP_METHOD_NAME: &str = "mcp.method.name";

/// "request", "notification" or "response".
pub const MCP_MESSAGE_TYPE: &str = "mcp.message.type";

/// Normalized JSON-RPC id.
pub const MCP_MESSAGE_ID: &str = "mcp.message.id";

/// Whether the reply carried a JSON-RPC error.
pub const MCP_RESULT_IS_ERROR: &str = "mcp.result.is_error";

/// JSON-RPC error code, on error.
pub const MCP_ERROR_CODE: &str = "mcp.error.code";

/// Outcome of the policing pipeline ("forward", "reject", "drop").
pub const MCP_POLICY_DECISION: &str = "mcp.policy.decision";

const TRACER_NAME: &str = "minibridge";

fn message_type(call: &McpCall) -> &'static str {
    if call.is_notification() {
        "notification"
    } else if call.is_response() {
        "response"
    } else {
        "request"
    }
}

/// Span name for a frame: its method, or `response` for replies.
pub fn span_name(call: &McpCall) -> String {
    call.method.clone().unwrap_or_else(|| "response".to_string())
}

/// Starts a span for `call` as a child of `parent`, using the global provider.
pub fn start_mcp_span(parent: &Context, call: &McpCall) -> BoxedSpan {
    let tracer = global::tracer(TRACER_NAME);

    let mut attributes = vec![KeyValue::new(MCP_MESSAGE_TYPE, message_type(call))];
    if let Some(method) = &call.method {
        attributes.push(KeyValue::new(MCP_METHOD_NAME, method.clone()));
    }
    if call.id.is_some() {
        attributes.push(KeyValue::new(MCP_MESSAGE_ID, call.id_string()));
    }

    tracer
        .span_builder(span_name(call))
        .with_kind(SpanKind::Server)
        .with_attributes(attributes)
        .start_with_context(&tracer, parent)
}

/// Records the reply outcome on `span` and ends it.
pub fn finish_mcp_span(span: &mut impl Span, reply: Option<&McpCall>) {
    match reply.and_then(|r| r.error.as_ref()) {
        Some(error) => {
            span.set_attribute(KeyValue::new(MCP_RESULT_IS_ERROR, true));
            span.set_attribute(KeyValue::new(MCP_ERROR_CODE, error.code));
            span.set_status(Status::error(error.message.clone()));
        }
        None => {
            span.set_attribute(KeyValue::new(MCP_RESULT_IS_ERROR, false));
            span.set_status(Status::Ok);
        }
    }
    span.end();
}
