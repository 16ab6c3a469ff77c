//! Local CLI invocation
//!
//! Cluster tooling is often driven through a local CLI rather than over SSH.
//! [`run_cli_command`] runs such a program, echoes the invocation and its
//! output, and optionally turns a non-zero exit into an error.

use crate::CommandError;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a local command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit code, -1 when terminated by a signal
    pub code: i32,
}

impl LocalOutput {
    /// Whether the program exited with code 0
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Run `program` with the whitespace-separated arguments in `command`.
///
/// With `check` set, a non-zero exit is returned as
/// [`CommandError::Failed`] carrying the captured streams.
pub async fn run_cli_command(program: &str, command: &str, check: bool) -> Result<LocalOutput, CommandError> {
    let args: Vec<&str> = command.split_whitespace().collect();

    let invocation = std::iter::once(program).chain(args.iter().copied()).collect::<Vec<_>>().join(" ");
    println!("\n>> {}\n", invocation);
    debug!("Running local command `{}`", invocation);

    let output = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let result = LocalOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        code: output.status.code().unwrap_or(-1),
    };
    println!("{} {}", result.stdout, result.stderr);

    if check && !result.success() {
        return Err(CommandError::Failed {
            code: result.code,
            stdout: result.stdout,
            stderr: result.stderr,
        });
    }

    Ok(result)
}
