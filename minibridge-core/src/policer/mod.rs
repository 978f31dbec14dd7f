//! Pluggable policy decision.
//!
//! A [`Policer`] looks at one MCP frame and either allows it unchanged
//! (`Ok(None)`), allows a rewritten version (`Ok(Some(call))`), or denies it
//! (`Err(PoliceError::Blocked)`). Every other error is an infrastructure
//! failure and says nothing about the frame itself; use
//! [`PoliceError::is_blocked`] to tell them apart.

pub mod api;
mod http;
mod rego;

pub use api::{CallType, Request, Response, SpanContext};
pub use http::HttpPolicer;
pub use rego::{RUNTIME_ENV_PREFIX, RegoPolicer};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::auth::Auth;
use crate::mcp::McpCall;

/// Reason used when a policer denies without saying why.
pub const GENERIC_DENY_REASON: &str = "denied by policy";

/// Errors returned by policers.
#[derive(Debug, thiserror::Error)]
pub enum PoliceError {
    /// The policy denied the frame.
    #[error("request blocked: {}", .reasons.join(", "))]
    Blocked { reasons: Vec<String> },

    #[error("unable to encode policer request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("unable to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("unable to send request: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("invalid response from policer `{body}`: {status}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("unable to decode response body: {reason}")]
    Decode { reason: String },

    #[error("unable to compile rego policy: {reason}")]
    Compile { reason: String },

    #[error("unable to eval {query} query: {reason}")]
    Evaluation { query: String, reason: String },
}

impl PoliceError {
    pub fn blocked<I, S>(reasons: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut reasons: Vec<String> = reasons.into_iter().map(Into::into).collect();
        if reasons.is_empty() {
            reasons.push(GENERIC_DENY_REASON.to_string());
        }
        PoliceError::Blocked { reasons }
    }

    /// True for policy denials, false for infrastructure failures.
    pub fn is_blocked(&self) -> bool {
        matches!(self, PoliceError::Blocked { .. })
    }
}

/// A policy decision engine.
#[async_trait]
pub trait Policer: Send + Sync {
    /// Short name used in logs (`http`, `rego`).
    fn kind(&self) -> &'static str;

    /// Evaluates one frame.
    async fn police(&self, request: &Request) -> Result<Option<McpCall>, PoliceError>;
}

/// Validated policer selection.
#[derive(Debug, Clone)]
pub enum PolicerConfig {
    Http {
        url: String,
        auth: Option<Auth>,
        timeout: Duration,
        skip_tls_verify: bool,
    },
    Rego {
        policy: String,
    },
}

/// Builds the policer described by `config`.
pub fn build_policer(config: &PolicerConfig) -> Result<Arc<dyn Policer>, PoliceError> {
    let policer: Arc<dyn Policer> = match config {
        PolicerConfig::Http {
            url,
            auth,
            timeout,
            skip_tls_verify,
        } => Arc::new(HttpPolicer::new(
            url.clone(),
            auth.clone(),
            *timeout,
            *skip_tls_verify,
        )?),
        PolicerConfig::Rego { policy } => Arc::new(RegoPolicer::new(policy.clone())?),
    };
    tracing::info!(kind = policer.kind(), "policer configured");
    Ok(policer)
}
