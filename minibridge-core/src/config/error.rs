//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::policer::PoliceError;
use crate::sbom::SbomError;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    // ─────────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────────
    #[error("configuration file not found (searched: {searched:?})")]
    ConfigFileNotFound { searched: Vec<PathBuf> },

    #[error("configuration file is empty")]
    EmptyConfigFile,

    #[error("unable to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("environment variable '{var}' not set")]
    MissingEnvVar { var: String },

    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_saphyr::Error),

    // ─────────────────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────────────────
    #[error("server command must not be empty")]
    EmptyCommand,

    #[error("http policer requires a url")]
    MissingPolicerUrl,

    #[error("invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("rego policer requires either policy or policy_file")]
    MissingPolicy,

    #[error("rego policer accepts only one of policy or policy_file")]
    ConflictingPolicy,

    #[error("session idle_timeout must be greater than zero")]
    ZeroIdleTimeout,

    #[error("invalid {field} {value}: must fit in an unsigned 32-bit integer")]
    IdOverflow { field: &'static str, value: i64 },

    #[error(transparent)]
    Sbom(#[from] SbomError),

    #[error(transparent)]
    Policer(#[from] PoliceError),
}
