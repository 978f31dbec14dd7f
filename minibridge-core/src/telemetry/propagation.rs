//! W3C trace context propagation through JSON-RPC `_meta`.
//!
//! Stdio transports have no headers, so agents carry `traceparent`,
//! `tracestate` and `baggage` as string entries of `params._meta`. The bridge
//! reads them as a carrier and removes `_meta` before the frame reaches the
//! peer.

use std::collections::HashMap;

use opentelemetry::Context;
use opentelemetry::propagation::{
    Extractor, TextMapCompositePropagator, TextMapPropagator,
};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use serde_json::{Map, Value};

/// Key of the transport-internal params object.
pub const META_KEY: &str = "_meta";

fn composite_propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// Carrier built from the string-valued entries of a `_meta` object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaCarrier(HashMap<String, String>);

impl MetaCarrier {
    pub fn from_meta(meta: &Map<String, Value>) -> Self {
        Self(
            meta.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Extractor for MetaCarrier {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Removes `_meta` from `params` and returns whatever it held, object or not.
///
/// A `params` map left empty is kept as an empty map so the frame shape does
/// not change. Only an object `_meta` can carry trace context, see
/// [`extract_context_from_meta`].
pub fn strip_meta(params: &mut Option<Map<String, Value>>) -> Option<Value> {
    params.as_mut()?.remove(META_KEY)
}

/// Extracts trace context and baggage from a `_meta` object.
///
/// Returns an empty context when the carrier holds no valid `traceparent`.
pub fn extract_context_from_meta(meta: &Map<String, Value>) -> Context {
    let carrier = MetaCarrier::from_meta(meta);
    if carrier.is_empty() {
        return Context::new();
    }
    composite_propagator().extract(&carrier)
}
