//! Error types for the CLI commands.

use minibridge_core::config::ConfigError;
use minibridge_core::process::StreamError;
use minibridge_core::sbom::{Mismatch, SbomError};
use minibridge_core::scan::ScanError;
use minibridge_core::session::SessionError;

/// Errors surfaced by `minibridge` subcommands.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unable to start MCP server: {0}")]
    Start(#[from] StreamError),

    #[error("unable to dump tools: {0}")]
    Scan(#[from] ScanError),

    #[error("unable to load sbom: {0}")]
    Sbom(#[from] SbomError),

    #[error("tools sbom does not match: {0}")]
    ToolsMismatch(#[source] Mismatch),

    #[error("prompts sbom does not match: {0}")]
    PromptsMismatch(#[source] Mismatch),

    #[error("no server command given: use `-- command [args...]` or --config")]
    MissingCommand,

    #[error("nothing to check: pass --config and/or --sbom with a server command")]
    NothingToCheck,

    #[error("unable to open bridge session: {0}")]
    Session(#[from] SessionError),

    #[error("unable to encode output: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
