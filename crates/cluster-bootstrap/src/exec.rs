//! External tool invocation.
//!
//! Every CLI the bootstrap drives (terraform, talosctl, arp-scan, virsh,
//! cilium, kubectl, flux) goes through [`run`] so each call is bounded by a
//! timeout and killed if the caller gives up on it.

use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{BootstrapError, Result};

fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}

/// Run a command to completion, bounded by `timeout`.
///
/// Returns the raw output regardless of exit status.
///
/// # Errors
///
/// Returns an error if the program cannot be spawned or exceeds `timeout`.
pub async fn run(mut cmd: Command, timeout: Duration) -> Result<Output> {
    let program = program_name(&cmd);
    debug!(program = %program, args = ?cmd.as_std().get_args().collect::<Vec<_>>(), "Running command");

    cmd.kill_on_drop(true);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(source)) => Err(BootstrapError::Spawn { program, source }),
        Err(_) => Err(BootstrapError::CommandTimeout {
            program,
            secs: timeout.as_secs(),
        }),
    }
}

/// Run a command and return its stdout, failing on a non-zero exit.
///
/// # Errors
///
/// Returns an error if the program cannot be spawned, times out or exits
/// unsuccessfully.
pub async fn run_checked(cmd: Command, timeout: Duration) -> Result<String> {
    let program = program_name(&cmd);
    let output = run(cmd, timeout).await?;

    if !output.status.success() {
        return Err(BootstrapError::CommandFailed {
            program,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that a tool is on `PATH` and responds to a version query.
///
/// # Errors
///
/// Returns an error if the tool is missing or broken.
pub async fn check_tool(program: &str, version_args: &[&str]) -> Result<()> {
    let mut cmd = Command::new(program);
    cmd.args(version_args);
    let version = run_checked(cmd, Duration::from_secs(30)).await?;
    debug!("{program} version: {}", version.trim());
    Ok(())
}
