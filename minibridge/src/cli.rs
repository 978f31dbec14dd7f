//! CLI argument types for `minibridge aio`, `scan` and `check`.
//!
//! These types are defined separately from `main.rs` so that integration tests
//! can parse them and build configurations from them directly.

use std::path::PathBuf;

use clap::{Args, ValueEnum};
use minibridge_core::config::{BridgeConfig, PolicerYamlConfig, ServerConfig, load_config};
use minibridge_core::scan::Exclusions;

use crate::error::CliError;

// ─────────────────────────────────────────────────────────────────────────────
// Aio Subcommand Args
// ─────────────────────────────────────────────────────────────────────────────

/// Arguments for `minibridge aio`.
///
/// Runs an MCP server as a child process and bridges it to our own stdin and
/// stdout, policing every frame in both directions.
#[derive(Args, Debug)]
pub struct AioArgs {
    /// Configuration file. Flags below override its values.
    #[arg(long, env = "MINIBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Rego policy file evaluated on every frame.
    #[arg(long, conflicts_with = "policer_url")]
    pub policy_file: Option<PathBuf>,

    /// URL of an HTTP policer.
    #[arg(long)]
    pub policer_url: Option<String>,

    /// Bearer token sent to the HTTP policer.
    #[arg(long, env = "MINIBRIDGE_POLICER_TOKEN", requires = "policer_url")]
    pub policer_token: Option<String>,

    /// Reference manifest checked against tools/list and prompts/list results.
    #[arg(long)]
    pub sbom: Option<PathBuf>,

    /// Log blocked frames and forward them anyway.
    #[arg(long)]
    pub no_enforce: bool,

    /// Print the server's stderr on exit instead of logging it.
    #[arg(long)]
    pub dump_stderr: bool,

    /// Run the server in a fresh temporary directory.
    #[arg(long)]
    pub use_tempdir: bool,

    /// Enable debug logging.
    #[arg(long)]
    pub verbose: bool,

    /// Server command and arguments (after `--`).
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

impl AioArgs {
    /// Builds the bridge configuration from the config file and flags.
    pub fn to_config(&self) -> Result<BridgeConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => {
                let Some((command, args)) = self.command.split_first() else {
                    return Err(CliError::MissingCommand);
                };
                BridgeConfig {
                    server: ServerConfig {
                        command: command.clone(),
                        args: args.to_vec(),
                        ..ServerConfig::default()
                    },
                    policer: None,
                    sbom: None,
                    session: Default::default(),
                    telemetry: Default::default(),
                    enforce: true,
                    dump_stderr: false,
                }
            }
        };

        if self.config.is_some() {
            if let Some((command, args)) = self.command.split_first() {
                config.server.command = command.clone();
                config.server.args = args.to_vec();
            }
        }

        if let Some(path) = &self.policy_file {
            config.policer = Some(PolicerYamlConfig::Rego {
                policy: None,
                policy_file: Some(path.clone()),
            });
        }

        if let Some(url) = &self.policer_url {
            config.policer = Some(PolicerYamlConfig::Http {
                url: Some(url.clone()),
                token: self.policer_token.clone(),
                user: None,
                password: None,
                timeout: None,
                skip_tls_verify: false,
            });
        }

        if let Some(path) = &self.sbom {
            config.sbom = Some(path.clone());
        }

        config.enforce &= !self.no_enforce;
        config.dump_stderr |= self.dump_stderr;
        config.server.use_tempdir |= self.use_tempdir;

        Ok(config)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scan Subcommand Args
// ─────────────────────────────────────────────────────────────────────────────

/// What `minibridge scan` prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScanOutput {
    /// Every tool, resource, resource template and prompt.
    Dump,
    /// The manifest (hashes of tools and prompts).
    Sbom,
}

/// Arguments for `minibridge scan`.
#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Output kind.
    #[arg(value_enum)]
    pub output: ScanOutput,

    /// Leave tools out of the scan.
    #[arg(long)]
    pub exclude_tools: bool,

    /// Leave resources and resource templates out of the scan.
    #[arg(long)]
    pub exclude_resources: bool,

    /// Leave prompts out of the scan.
    #[arg(long)]
    pub exclude_prompts: bool,

    /// Enable debug logging.
    #[arg(long)]
    pub verbose: bool,

    /// Server command and arguments (after `--`).
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

impl ScanArgs {
    pub fn exclusions(&self) -> Exclusions {
        Exclusions {
            tools: self.exclude_tools,
            resources: self.exclude_resources,
            prompts: self.exclude_prompts,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Check Subcommand Args
// ─────────────────────────────────────────────────────────────────────────────

/// Arguments for `minibridge check`.
///
/// Validates a configuration file, and/or scans a server and compares it to
/// a manifest.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Configuration file to validate.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Manifest the server must match.
    #[arg(long)]
    pub sbom: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    pub verbose: bool,

    /// Server command and arguments (after `--`), required with --sbom.
    #[arg(trailing_var_arg = true, requires = "sbom")]
    pub command: Vec<String>,
}
