//! CLI argument parsing tests.
//!
//! Tests that AioArgs, ScanArgs and CheckArgs parse from command-line strings
//! and that AioArgs builds the expected bridge configuration.

use std::io::Write;

use clap::{Parser, Subcommand};

use minibridge::cli::{AioArgs, CheckArgs, ScanArgs, ScanOutput};
use minibridge::error::CliError;
use minibridge_core::config::PolicerYamlConfig;

// ─────────────────────────────────────────────────────────────────────────────
// Test Harness
// ─────────────────────────────────────────────────────────────────────────────

/// Minimal CLI parser that mirrors main.rs's Cli, usable from integration tests.
#[derive(Parser)]
#[command(name = "minibridge")]
struct TestCli {
    #[command(subcommand)]
    command: TestCommands,
}

#[derive(Subcommand)]
enum TestCommands {
    Aio(AioArgs),
    Scan(ScanArgs),
    Check(CheckArgs),
}

fn parse(args: &[&str]) -> Result<TestCli, clap::Error> {
    TestCli::try_parse_from(args)
}

fn aio(args: &[&str]) -> AioArgs {
    match parse(args).unwrap().command {
        TestCommands::Aio(a) => a,
        _ => panic!("expected aio"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AioArgs Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_aio_trailing_command() {
    let args = aio(&["minibridge", "aio", "--", "npx", "-y", "server-everything"]);
    assert_eq!(args.command, vec!["npx", "-y", "server-everything"]);
    assert!(!args.no_enforce);

    let config = args.to_config().unwrap();
    assert_eq!(config.server.command, "npx");
    assert_eq!(config.server.args, vec!["-y", "server-everything"]);
    assert!(config.enforce);
    assert!(config.policer.is_none());
}

#[test]
fn test_aio_flags_override() {
    let args = aio(&[
        "minibridge",
        "aio",
        "--policer-url",
        "https://policer.local/police",
        "--policer-token",
        "tok",
        "--no-enforce",
        "--dump-stderr",
        "--",
        "cat",
    ]);
    let config = args.to_config().unwrap();
    assert!(!config.enforce);
    assert!(config.dump_stderr);
    match config.policer.unwrap() {
        PolicerYamlConfig::Http { url, token, .. } => {
            assert_eq!(url.as_deref(), Some("https://policer.local/police"));
            assert_eq!(token.as_deref(), Some("tok"));
        }
        other => panic!("unexpected policer {other:?}"),
    }
}

#[test]
fn test_aio_policy_file_conflicts_with_url() {
    let result = parse(&[
        "minibridge",
        "aio",
        "--policy-file",
        "p.rego",
        "--policer-url",
        "http://x",
        "--",
        "cat",
    ]);
    assert!(result.is_err());
}

#[test]
fn test_aio_without_command_or_config() {
    let args = aio(&["minibridge", "aio"]);
    assert!(matches!(args.to_config(), Err(CliError::MissingCommand)));
}

#[test]
fn test_aio_config_file_with_command_override() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "server:\n  command: original\n  args: [x]\nenforce: true").unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let args = aio(&["minibridge", "aio", "--config", &path, "--", "cat", "-u"]);
    let config = args.to_config().unwrap();
    assert_eq!(config.server.command, "cat");
    assert_eq!(config.server.args, vec!["-u"]);
}

// ─────────────────────────────────────────────────────────────────────────────
// ScanArgs / CheckArgs Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_scan_args() {
    let cli = parse(&["minibridge", "scan", "sbom", "--exclude-resources", "--", "srv"]).unwrap();
    let TestCommands::Scan(args) = cli.command else {
        panic!("expected scan");
    };
    assert_eq!(args.output, ScanOutput::Sbom);
    assert_eq!(args.command, vec!["srv"]);
    let exclusions = args.exclusions();
    assert!(exclusions.resources);
    assert!(!exclusions.tools);
}

#[test]
fn test_scan_requires_command() {
    assert!(parse(&["minibridge", "scan", "dump"]).is_err());
}

#[test]
fn test_scan_rejects_unknown_output() {
    assert!(parse(&["minibridge", "scan", "tools", "--", "srv"]).is_err());
}

#[test]
fn test_check_command_requires_sbom() {
    assert!(parse(&["minibridge", "check", "--", "srv"]).is_err());

    let cli = parse(&["minibridge", "check", "--sbom", "ref.json", "--", "srv", "a"]).unwrap();
    let TestCommands::Check(args) = cli.command else {
        panic!("expected check");
    };
    assert_eq!(args.command, vec!["srv", "a"]);
}
