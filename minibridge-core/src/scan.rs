//! Inventory of what an MCP server exposes, and the manifest derived from it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::mcp::{McpCall, Notification, Prompt, ProtocolVersion, Resource, ResourceTemplate, Tool};
use crate::process::{McpStream, StreamError};
use crate::sbom::{Sbom, hash_prompts, hash_tools};

/// Errors raised while scanning a server.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("unable to send {method} mcp request: {source}")]
    Request {
        method: &'static str,
        #[source]
        source: StreamError,
    },

    #[error("unable to convert {field}: {source}")]
    Convert {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Listings to leave out of a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Exclusions {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
}

/// Everything a server listed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dump {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,

    #[serde(
        default,
        rename = "resourceTemplates",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub resource_templates: Vec<ResourceTemplate>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompts: Vec<Prompt>,
}

impl Dump {
    /// Manifest of the dumped tools and prompts.
    pub fn sbom(&self) -> Sbom {
        Sbom {
            tools: hash_tools(&self.tools),
            prompts: hash_prompts(&self.prompts),
        }
    }
}

/// Initializes the server behind `stream` and collects every paginated
/// listing not excluded.
pub async fn dump_all(
    cancel: &CancellationToken,
    stream: &McpStream,
    exclusions: Exclusions,
) -> Result<Dump, ScanError> {
    stream
        .send_request(cancel, &McpCall::init(ProtocolVersion::V2025_03_26))
        .await
        .map_err(|source| ScanError::Request {
            method: "initialize",
            source,
        })?;

    stream
        .send_notification(cancel, &Notification::new("notifications/initialized"))
        .await
        .map_err(|source| ScanError::Request {
            method: "notifications/initialized",
            source,
        })?;

    let mut dump = Dump::default();

    if !exclusions.tools {
        dump.tools = list(cancel, stream, "tools/list", "tools").await?;
    }

    if !exclusions.resources {
        dump.resources = list(cancel, stream, "resources/list", "resources").await?;
        dump.resource_templates = list(
            cancel,
            stream,
            "resources/templates/list",
            "resourceTemplates",
        )
        .await?;
    }

    if !exclusions.prompts {
        dump.prompts = list(cancel, stream, "prompts/list", "prompts").await?;
    }

    tracing::info!(
        tools = dump.tools.len(),
        resources = dump.resources.len(),
        resource_templates = dump.resource_templates.len(),
        prompts = dump.prompts.len(),
        "mcp server scanned"
    );

    Ok(dump)
}

async fn list<T: DeserializeOwned>(
    cancel: &CancellationToken,
    stream: &McpStream,
    method: &'static str,
    field: &'static str,
) -> Result<Vec<T>, ScanError> {
    let request = McpCall::request(uuid::Uuid::new_v4().to_string(), method);
    let pages = stream
        .send_paginated_request(cancel, &request)
        .await
        .map_err(|source| ScanError::Request { method, source })?;

    let mut items = Vec::new();
    for page in pages {
        let Some(value) = page.result.and_then(|mut r| r.remove(field)) else {
            continue;
        };
        let mut batch: Vec<T> =
            serde_json::from_value(value).map_err(|source| ScanError::Convert { field, source })?;
        items.append(&mut batch);
    }
    Ok(items)
}
