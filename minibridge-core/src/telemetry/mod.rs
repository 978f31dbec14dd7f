//! OpenTelemetry tracing initialization and lifecycle management.
//!
//! The bridge does not export spans itself. [`init_telemetry`] installs the
//! W3C propagators and a tracer provider so that spans resumed from `_meta`
//! carriers have valid ids that policers can correlate on.
//!
//! # Submodules
//!
//! - [`propagation`] - trace context extraction from JSON-RPC `_meta`
//! - [`spans`] - MCP span attributes and helpers

pub mod propagation;
pub mod spans;

pub use propagation::{extract_context_from_meta, strip_meta};
pub use spans::{
    MCP_ERROR_CODE, MCP_MESSAGE_ID, MCP_MESSAGE_TYPE, MCP_METHOD_NAME, MCP_POLICY_DECISION,
    MCP_RESULT_IS_ERROR, finish_mcp_span, start_mcp_span,
};

pub use opentelemetry::global::BoxedSpan;

use opentelemetry::global;
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::SdkTracerProvider;

/// Default `service.name` resource attribute.
pub const DEFAULT_SERVICE_NAME: &str = "minibridge";

/// Configuration for tracing initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// When false, [`init_telemetry`] leaves the global provider untouched
    /// and spans are noops.
    pub enabled: bool,

    /// OTel resource `service.name` attribute.
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

/// Errors that can occur during telemetry shutdown.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("tracer provider shutdown failed: {reason}")]
    Shutdown { reason: String },
}

/// Holds the tracer provider for the lifetime of the bridge.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Returns the installed provider, if telemetry is enabled.
    pub fn provider(&self) -> Option<&SdkTracerProvider> {
        self.provider.as_ref()
    }

    /// Flushes and shuts down the provider.
    pub fn shutdown(&self) -> Result<(), TelemetryError> {
        let Some(provider) = &self.provider else {
            return Ok(());
        };
        provider.shutdown().map_err(|e| TelemetryError::Shutdown {
            reason: e.to_string(),
        })
    }
}

/// Installs the composite W3C propagator and, when enabled, a tracer
/// provider with no exporters as the global provider.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    if !config.enabled {
        tracing::debug!("telemetry disabled");
        return TelemetryGuard { provider: None };
    }

    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .build();

    let provider = SdkTracerProvider::builder().with_resource(resource).build();
    global::set_tracer_provider(provider.clone());

    tracing::info!(service_name = %config.service_name, "telemetry initialized");

    TelemetryGuard {
        provider: Some(provider),
    }
}
