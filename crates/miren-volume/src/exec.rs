//! Subprocess execution for filesystem tooling.

use tokio::process::Command;

use crate::error::{Error, Result};

/// Outcome of a finished command.
#[derive(Debug)]
pub(crate) struct CommandResult {
    /// Exit code; -1 when the process was killed by a signal.
    pub code: i32,

    /// Combined stdout and stderr, trimmed.
    pub output: String,
}

fn render(argv: &[String]) -> String {
    argv.join(" ")
}

/// Runs a command and captures its exit code and output.
///
/// Spawn failures (binary missing, permissions) surface as
/// [`Error::CommandFailed`] so callers see one error shape for tooling.
pub(crate) async fn run(argv: &[String]) -> Result<CommandResult> {
    let (program, args) = argv.split_first().ok_or_else(|| Error::CommandFailed {
        command: String::new(),
        code: -1,
        output: "empty command line".to_string(),
    })?;

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::CommandFailed {
            command: render(argv),
            code: -1,
            output: e.to_string(),
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
    }

    Ok(CommandResult {
        code: output.status.code().unwrap_or(-1),
        output: combined.trim().to_string(),
    })
}

/// Runs a command and fails unless it exits zero.
pub(crate) async fn run_checked(argv: &[String]) -> Result<()> {
    let result = run(argv).await?;
    if result.code != 0 {
        return Err(Error::CommandFailed {
            command: render(argv),
            code: result.code,
            output: result.output,
        });
    }
    Ok(())
}
