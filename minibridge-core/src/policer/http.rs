use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};

use super::{PoliceError, Policer, Request, Response};
use crate::auth::Auth;
use crate::mcp::McpCall;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Policer delegating decisions to a remote HTTP service.
///
/// The request is POSTed as JSON. `204 No Content` allows the frame
/// unchanged; `200 OK` carries a [`Response`]; any other status is an error.
pub struct HttpPolicer {
    endpoint: String,
    auth: Option<Auth>,
    client: reqwest::Client,
}

impl HttpPolicer {
    pub fn new(
        endpoint: impl Into<String>,
        auth: Option<Auth>,
        timeout: Duration,
        skip_tls_verify: bool,
    ) -> Result<Self, PoliceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .danger_accept_invalid_certs(skip_tls_verify)
            .build()
            .map_err(PoliceError::Client)?;

        Ok(Self {
            endpoint: endpoint.into(),
            auth,
            client,
        })
    }
}

#[async_trait]
impl Policer for HttpPolicer {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn police(&self, request: &Request) -> Result<Option<McpCall>, PoliceError> {
        let body = serde_json::to_vec(request).map_err(PoliceError::Encode)?;

        let mut req = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(auth) = &self.auth {
            req = req.header(AUTHORIZATION, auth.encode());
        }

        let resp = req.send().await.map_err(PoliceError::Transport)?;
        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body = resp.bytes().await.map_err(PoliceError::Transport)?;
        if status != StatusCode::OK {
            return Err(PoliceError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let mut decision: Response =
            serde_json::from_slice(&body).map_err(|e| PoliceError::Decode {
                reason: e.to_string(),
            })?;

        if let (Some(mcp), Some(id)) = (decision.mcp.as_mut(), request.mcp.id.as_ref()) {
            mcp.id = Some(id.clone());
        }

        if decision.allow {
            return Ok(decision.mcp);
        }

        tracing::debug!(reasons = ?decision.reasons, "http policer denied call");
        Err(PoliceError::blocked(decision.reasons))
    }
}
