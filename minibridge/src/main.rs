//! Minibridge CLI entry point.
//!
//! Dispatches to `aio` (stdio bridge with policing), `scan` (server
//! inventory and manifest generation) or `check` (configuration and
//! manifest verification).

use clap::{Parser, Subcommand};

use minibridge::aio::run_aio;
use minibridge::cli::{AioArgs, CheckArgs, ScanArgs};
use minibridge::scan::{run_check, run_scan};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Definitions
// ─────────────────────────────────────────────────────────────────────────────

/// Minibridge: secure bridge between MCP agents and MCP servers.
#[derive(Parser)]
#[command(name = "minibridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an MCP server and bridge it to stdio, policing every frame.
    Aio(AioArgs),
    /// Scan an MCP server and print its inventory or manifest.
    Scan(ScanArgs),
    /// Validate a configuration file and/or check a server against a manifest.
    Check(CheckArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry Point
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Aio(args) => {
            init_tracing(args.verbose);
            match run_aio(args).await {
                Ok(code) => code,
                Err(e) => fail("aio", &e),
            }
        }
        Commands::Scan(args) => {
            init_tracing(args.verbose);
            match run_scan(args).await {
                Ok(()) => 0,
                Err(e) => fail("scan", &e),
            }
        }
        Commands::Check(args) => {
            init_tracing(args.verbose);
            match run_check(args).await {
                Ok(()) => 0,
                Err(e) => fail("check", &e),
            }
        }
    };

    std::process::exit(code);
}

fn fail(command: &str, error: &minibridge::error::CliError) -> i32 {
    tracing::error!(error = %error, "{command} failed");
    eprintln!("minibridge {command}: {error}");
    1
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracing Init
// ─────────────────────────────────────────────────────────────────────────────

/// Initialise tracing subscriber with stderr output.
///
/// When `verbose` is true, sets filter to `debug`. Otherwise, respects
/// `RUST_LOG` environment variable (defaulting to no output). Stdout is
/// reserved for the JSON-RPC stream.
fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
