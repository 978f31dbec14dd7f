//! Configuration schema type definitions.
//!
//! # Example
//! ```yaml
//! server:
//!   command: npx
//!   args: ["-y", "@modelcontextprotocol/server-everything"]
//!   env:
//!     CACHE_DIR: _MINIBRIDGE_PREFIX_/cache
//!   use_tempdir: true
//!
//! policer:
//!   kind: rego
//!   policy_file: /etc/minibridge/policy.rego
//!
//! sbom: /etc/minibridge/sbom.json
//!
//! session:
//!   idle_timeout: 30s
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::duration_format;
use crate::session::DEFAULT_IDLE_TIMEOUT;
use crate::telemetry::DEFAULT_SERVICE_NAME;

/// Default timeout of HTTP policer calls.
pub const DEFAULT_POLICER_TIMEOUT: Duration = Duration::from_secs(10);

fn default_true() -> bool {
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Top-Level Schema
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// The MCP server to spawn.
    pub server: ServerConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policer: Option<PolicerYamlConfig>,

    /// Path of the reference manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sbom: Option<PathBuf>,

    #[serde(default)]
    pub session: SessionYamlConfig,

    #[serde(default)]
    pub telemetry: TelemetryYamlConfig,

    /// When false, blocked frames are logged and forwarded anyway.
    #[serde(default = "default_true")]
    pub enforce: bool,

    /// Dump the server's stderr to our stderr on exit instead of logging it.
    #[serde(default)]
    pub dump_stderr: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

/// How to launch the MCP server.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    pub command: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Extra environment. `_MINIBRIDGE_PREFIX_` is replaced with the working directory.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Run the server in a fresh temporary directory.
    #[serde(default)]
    pub use_tempdir: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<i64>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Policer
// ─────────────────────────────────────────────────────────────────────────────

/// Policer selection as written in the file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PolicerYamlConfig {
    Http {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,

        /// Bearer token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,

        /// Basic auth user; takes precedence over `token`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,

        #[serde(
            default,
            with = "duration_format::option",
            skip_serializing_if = "Option::is_none"
        )]
        timeout: Option<Duration>,

        #[serde(default)]
        skip_tls_verify: bool,
    },
    Rego {
        /// Inline policy source.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        policy: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        policy_file: Option<PathBuf>,
    },
}

impl PolicerYamlConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            PolicerYamlConfig::Http { .. } => "http",
            PolicerYamlConfig::Rego { .. } => "rego",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session and Telemetry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionYamlConfig {
    #[serde(default = "default_idle_timeout", with = "duration_format")]
    pub idle_timeout: Duration,
}

fn default_idle_timeout() -> Duration {
    DEFAULT_IDLE_TIMEOUT
}

impl Default for SessionYamlConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryYamlConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_string()
}

impl Default for TelemetryYamlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: default_service_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config: BridgeConfig = serde_saphyr::from_str("server:\n  command: cat\n").unwrap();
        assert_eq!(config.server.command, "cat");
        assert!(config.policer.is_none());
        assert!(config.enforce);
        assert!(!config.dump_stderr);
        assert_eq!(config.session.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.telemetry.service_name, "minibridge");
    }

    #[test]
    fn test_policer_kinds() {
        let yaml = r#"
server:
  command: cat
policer:
  kind: http
  url: https://policer.local/police
  token: secret
  timeout: 2s
"#;
        let config: BridgeConfig = serde_saphyr::from_str(yaml).unwrap();
        match config.policer.unwrap() {
            PolicerYamlConfig::Http { url, token, timeout, .. } => {
                assert_eq!(url.as_deref(), Some("https://policer.local/police"));
                assert_eq!(token.as_deref(), Some("secret"));
                assert_eq!(timeout, Some(Duration::from_secs(2)));
            }
            other => panic!("unexpected policer {other:?}"),
        }
    }

    #[test]
    fn test_unknown_policer_kind_rejected() {
        let yaml = "server:\n  command: cat\npolicer:\n  kind: cedar\n";
        assert!(serde_saphyr::from_str::<BridgeConfig>(yaml).is_err());
    }
}
