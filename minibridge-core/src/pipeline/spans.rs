//! Request/response span pairing.
//!
//! The first frame seen with a given id opens a span; the next frame with
//! the same id (its reply) ends it and evicts the entry. Entries whose reply
//! never comes are ended after the TTL. Notifications get a span that is
//! ended immediately.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::Context;
use opentelemetry::global::BoxedSpan;
use opentelemetry::trace::{Span, TraceContextExt};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::mcp::McpCall;
use crate::policer::SpanContext;
use crate::telemetry::spans::{finish_mcp_span, span_name, start_mcp_span};

/// How long an unanswered request keeps its span open.
pub const SPAN_TTL: Duration = Duration::from_secs(60);

struct Pending {
    span: BoxedSpan,
    context: SpanContext,
    opened: Instant,
}

/// TTL cache of open spans keyed by normalized JSON-RPC id.
pub struct SpanCorrelator {
    ttl: Duration,
    pending: Mutex<HashMap<String, Pending>>,
}

impl Default for SpanCorrelator {
    fn default() -> Self {
        Self::new(SPAN_TTL)
    }
}

impl SpanCorrelator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Number of requests waiting for their reply.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Records `call` and returns the span context policers should see.
    pub fn observe(&self, parent: &Context, call: &McpCall) -> SpanContext {
        let mut pending = self.pending.lock();
        self.evict_expired(&mut pending);

        if call.id.is_none() {
            let mut span = start_mcp_span(parent, call);
            let mut context = span_context(parent, &span, call, Utc::now());
            finish_mcp_span(&mut span, None);
            context.end = Some(Utc::now());
            return context;
        }

        let key = call.id_string();
        if let Some(mut opened) = pending.remove(&key) {
            finish_mcp_span(&mut opened.span, Some(call));
            opened.context.end = Some(Utc::now());
            tracing::debug!(id = %key, "span pair closed");
            return opened.context;
        }

        let span = start_mcp_span(parent, call);
        let context = span_context(parent, &span, call, Utc::now());
        pending.insert(
            key,
            Pending {
                span,
                context: context.clone(),
                opened: Instant::now(),
            },
        );
        context
    }

    fn evict_expired(&self, pending: &mut HashMap<String, Pending>) {
        let ttl = self.ttl;
        pending.retain(|id, entry| {
            if entry.opened.elapsed() < ttl {
                return true;
            }
            tracing::debug!(id = %id, "span expired without reply");
            entry.span.end();
            false
        });
    }
}

fn span_context(
    parent: &Context,
    span: &BoxedSpan,
    call: &McpCall,
    start: DateTime<Utc>,
) -> SpanContext {
    let sc = span.span_context();
    let parent_span = parent.span();
    let parent_sc = parent_span.span_context();
    SpanContext {
        trace_id: sc.trace_id().to_string(),
        span_id: sc.span_id().to_string(),
        parent_span_id: if parent_sc.is_valid() {
            parent_sc.span_id().to_string()
        } else {
            String::new()
        },
        name: span_name(call),
        start,
        end: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(id: i64) -> McpCall {
        let mut call = McpCall::new(Some(json!(id)));
        call.result = Some(serde_json::Map::new());
        call
    }

    #[test]
    fn test_request_then_reply_pairs() {
        let spans = SpanCorrelator::default();
        let cx = Context::new();

        let opened = spans.observe(&cx, &McpCall::request(1, "tools/list"));
        assert_eq!(opened.name, "tools/list");
        assert!(opened.end.is_none());
        assert_eq!(spans.pending(), 1);

        let closed = spans.observe(&cx, &reply(1));
        assert_eq!(closed.name, "tools/list");
        assert_eq!(closed.start, opened.start);
        assert!(closed.end.is_some());
        assert_eq!(spans.pending(), 0);
    }

    #[test]
    fn test_pairs_across_numeric_representations() {
        let spans = SpanCorrelator::default();
        let cx = Context::new();

        spans.observe(&cx, &McpCall::request(3, "tools/call"));
        let mut float_reply = McpCall::new(Some(json!(3.0)));
        float_reply.result = Some(serde_json::Map::new());
        assert!(spans.observe(&cx, &float_reply).end.is_some());
        assert_eq!(spans.pending(), 0);
    }

    #[test]
    fn test_notification_is_unpaired() {
        let spans = SpanCorrelator::default();
        let mut notif = McpCall::new(None);
        notif.method = Some("notifications/progress".into());

        let context = spans.observe(&Context::new(), &notif);
        assert!(context.end.is_some());
        assert_eq!(spans.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_expires() {
        let spans = SpanCorrelator::new(Duration::from_secs(60));
        let cx = Context::new();

        spans.observe(&cx, &McpCall::request(1, "tools/list"));
        tokio::time::advance(Duration::from_secs(61)).await;

        // The late reply opens a fresh entry since the request expired.
        let context = spans.observe(&cx, &reply(1));
        assert!(context.end.is_none());
        assert_eq!(context.name, "response");
        assert_eq!(spans.pending(), 1);
    }
}
