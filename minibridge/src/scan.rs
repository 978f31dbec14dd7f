//! `minibridge scan` and `minibridge check`.

use minibridge_core::config::load_and_validate;
use minibridge_core::process::StdioServer;
use minibridge_core::sbom::Sbom;
use minibridge_core::scan::{Dump, Exclusions, dump_all};
use tokio_util::sync::CancellationToken;

use crate::cli::{CheckArgs, ScanArgs, ScanOutput};
use crate::error::CliError;

/// Starts `command`, dumps everything it lists, and stops it.
pub async fn scan_server(command: &[String], exclusions: Exclusions) -> Result<Dump, CliError> {
    let Some((program, args)) = command.split_first() else {
        return Err(CliError::MissingCommand);
    };

    let cancel = CancellationToken::new();
    let server = StdioServer::new(program.clone()).with_args(args.iter().cloned());
    let stream = server.start(cancel.clone())?;

    let dump = dump_all(&cancel, &stream, exclusions).await;
    cancel.cancel();

    let mut exit = stream.subscribe_exit();
    if let Some(status) = exit.recv().await {
        tracing::debug!(exit = %status, "scanned mcp server stopped");
    }

    Ok(dump?)
}

/// Runs `minibridge scan`, printing JSON to stdout.
pub async fn run_scan(args: ScanArgs) -> Result<(), CliError> {
    let dump = scan_server(&args.command, args.exclusions()).await?;

    let out = match args.output {
        ScanOutput::Dump => serde_json::to_string_pretty(&dump)?,
        ScanOutput::Sbom => serde_json::to_string_pretty(&dump.sbom())?,
    };
    println!("{out}");
    Ok(())
}

/// Compares a scanned manifest with a reference one.
pub fn compare(reference: &Sbom, observed: &Sbom) -> Result<(), CliError> {
    reference
        .tools
        .matches(&observed.tools)
        .map_err(CliError::ToolsMismatch)?;
    reference
        .prompts
        .matches(&observed.prompts)
        .map_err(CliError::PromptsMismatch)?;
    Ok(())
}

/// Runs `minibridge check`.
pub async fn run_check(args: CheckArgs) -> Result<(), CliError> {
    if args.config.is_none() && args.sbom.is_none() {
        return Err(CliError::NothingToCheck);
    }

    if let Some(path) = &args.config {
        load_and_validate(path)?;
        println!("{}: configuration is valid", path.display());
    }

    if let Some(path) = &args.sbom {
        let reference = Sbom::load(path)?;
        let dump = scan_server(&args.command, Exclusions::default()).await?;
        compare(&reference, &dump.sbom())?;
        println!("{}: mcp server matches", path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use minibridge_core::mcp::Tool;
    use minibridge_core::sbom::hash_tools;

    fn tool(name: &str, description: &str) -> Tool {
        Tool {
            name: name.into(),
            description: description.into(),
            ..Tool::default()
        }
    }

    #[test]
    fn test_compare_matching() {
        let sbom = Sbom {
            tools: hash_tools(&[tool("a", "first")]),
            ..Sbom::default()
        };
        assert!(compare(&sbom, &sbom.clone()).is_ok());
    }

    #[test]
    fn test_compare_reports_tool_mismatch() {
        let reference = Sbom {
            tools: hash_tools(&[tool("a", "first")]),
            ..Sbom::default()
        };
        let observed = Sbom {
            tools: hash_tools(&[tool("a", "changed")]),
            ..Sbom::default()
        };
        let err = compare(&reference, &observed).unwrap_err();
        assert_eq!(err.to_string(), "tools sbom does not match: 'a': hash mismatch");
    }

    #[tokio::test]
    async fn test_scan_without_command() {
        let err = scan_server(&[], Exclusions::default()).await.unwrap_err();
        assert!(matches!(err, CliError::MissingCommand));
    }
}
