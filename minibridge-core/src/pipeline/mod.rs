//! Policing pipeline.
//!
//! Every frame crossing the backend boundary goes through [`Pipeline::police`]:
//!
//! 1. decode, answering undecodable frames with a 500 error
//! 2. strip `_meta` and resume the trace it carries
//! 3. pair request and reply spans
//! 4. check `tools/list` and `prompts/list` results against the manifest
//! 5. ask the policer, if any
//!
//! The manifest check runs first so that a permissive policy never gets to
//! rescue a tampered tool list. Blocks become 451 errors addressed to the
//! agent, unless enforcement is off, in which case they are only logged.

mod spans;

pub use spans::{SPAN_TTL, SpanCorrelator};

use std::sync::Arc;

use bytes::Bytes;
use opentelemetry::Context;
use serde_json::Value;

use crate::identity::Agent;
use crate::mcp::{ERROR_CODE_BLOCKED, ERROR_CODE_DECODE, McpCall, Prompt, Tool};
use crate::policer::{CallType, PoliceError, Policer, Request};
use crate::sbom::{Sbom, hash_prompts, hash_tools};
use crate::telemetry::propagation::{extract_context_from_meta, strip_meta};

/// Runtime options of a [`Pipeline`].
#[derive(Clone)]
pub struct PipelineOptions {
    /// When false, blocks are logged and the original frame is forwarded.
    pub enforce: bool,

    /// Reference manifest for `tools/list` and `prompts/list` results.
    pub sbom: Option<Sbom>,

    pub policer: Option<Arc<dyn Policer>>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            enforce: true,
            sbom: None,
            policer: None,
        }
    }
}

impl std::fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOptions")
            .field("enforce", &self.enforce)
            .field("sbom", &self.sbom.is_some())
            .field("policer", &self.policer.as_ref().map(|p| p.kind()))
            .finish()
    }
}

/// What to do with a policed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send these bytes on in the frame's direction.
    Forward(Bytes),

    /// Send these bytes back to the agent instead of the frame.
    Reject(Bytes),

    /// Send nothing.
    Drop,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Forward(_) => "forward",
            Outcome::Reject(_) => "reject",
            Outcome::Drop => "drop",
        }
    }
}

/// Shared policing state for one bridge.
pub struct Pipeline {
    options: PipelineOptions,
    spans: SpanCorrelator,
}

impl Pipeline {
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            options,
            spans: SpanCorrelator::default(),
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Polices one frame travelling in `call_type` direction.
    pub async fn police(&self, call_type: CallType, agent: &Agent, data: &[u8]) -> Outcome {
        let mut call = match McpCall::decode(data) {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(r#type = call_type.as_str(), error = %e, "unable to decode frame");
                return reply(&McpCall::error(None, ERROR_CODE_DECODE, e.to_string()));
            }
        };

        let meta = strip_meta(&mut call.params);
        let parent = match &meta {
            Some(Value::Object(carrier)) => extract_context_from_meta(carrier),
            _ => Context::new(),
        };
        let span_context = self.spans.observe(&parent, &call);

        if call_type == CallType::Response {
            if let Some(sbom) = &self.options.sbom {
                if let Err(reason) = check_manifest(sbom, &call) {
                    let err = PoliceError::blocked([reason]);
                    if let Some(outcome) = self.block(call_type, &call, &err, data) {
                        return outcome;
                    }
                }
            }
        }

        let Some(policer) = &self.options.policer else {
            return self.pass(meta.is_some(), &call, data);
        };

        let mut request = Request::new(call_type, call, agent.clone());
        request.span_context = Some(span_context);

        match policer.police(&request).await {
            Ok(None) => self.pass(meta.is_some(), &request.mcp, data),
            Ok(Some(mutated)) => {
                tracing::debug!(
                    r#type = call_type.as_str(),
                    id = %request.mcp.id_string(),
                    "frame rewritten by policer"
                );
                encoded(&mutated).map_or(Outcome::Drop, Outcome::Forward)
            }
            Err(err) if err.is_blocked() => self
                .block(call_type, &request.mcp, &err, data)
                .unwrap_or_else(|| self.pass(meta.is_some(), &request.mcp, data)),
            Err(err) => {
                tracing::error!(
                    r#type = call_type.as_str(),
                    kind = policer.kind(),
                    id = %request.mcp.id_string(),
                    error = %err,
                    "unable to police frame"
                );
                Outcome::Drop
            }
        }
    }

    /// Returns the 451 reply for a block, or None when enforcement is off.
    fn block(
        &self,
        call_type: CallType,
        call: &McpCall,
        err: &PoliceError,
        data: &[u8],
    ) -> Option<Outcome> {
        if !self.options.enforce {
            tracing::warn!(
                r#type = call_type.as_str(),
                id = %call.id_string(),
                reason = %err,
                size = data.len(),
                "frame would have been blocked"
            );
            return None;
        }

        tracing::info!(
            r#type = call_type.as_str(),
            id = %call.id_string(),
            reason = %err,
            "frame blocked"
        );
        Some(reply(&McpCall::error(
            call.id.clone(),
            ERROR_CODE_BLOCKED,
            err.to_string(),
        )))
    }

    /// Forwards the original bytes, or the re-encoded call when `_meta` had
    /// to be removed from it.
    fn pass(&self, stripped: bool, call: &McpCall, data: &[u8]) -> Outcome {
        if !stripped {
            return Outcome::Forward(Bytes::copy_from_slice(data));
        }
        encoded(call).map_or(Outcome::Drop, Outcome::Forward)
    }
}

fn encoded(call: &McpCall) -> Option<Bytes> {
    match call.encode() {
        Ok(data) => Some(Bytes::from(data)),
        Err(e) => {
            tracing::error!(id = %call.id_string(), error = %e, "unable to encode frame");
            None
        }
    }
}

fn reply(call: &McpCall) -> Outcome {
    encoded(call).map_or(Outcome::Drop, Outcome::Reject)
}

/// Compares the tools or prompts of a list result with the manifest.
fn check_manifest(sbom: &Sbom, call: &McpCall) -> Result<(), String> {
    let Some(result) = &call.result else {
        return Ok(());
    };

    // An empty manifest section does not constrain that listing.
    if let Some(tools) = result.get("tools") {
        if !sbom.tools.is_empty() {
            let tools: Vec<Tool> = decode_list(tools, "tools")?;
            sbom.tools
                .matches(&hash_tools(&tools))
                .map_err(|m| m.to_string())?;
        }
    }

    if let Some(prompts) = result.get("prompts") {
        if !sbom.prompts.is_empty() {
            let prompts: Vec<Prompt> = decode_list(prompts, "prompts")?;
            sbom.prompts
                .matches(&hash_prompts(&prompts))
                .map_err(|m| m.to_string())?;
        }
    }

    Ok(())
}

fn decode_list<T: serde::de::DeserializeOwned>(value: &Value, field: &str) -> Result<Vec<T>, String> {
    serde_json::from_value(value.clone()).map_err(|e| format!("unable to decode {field}: {e}"))
}
