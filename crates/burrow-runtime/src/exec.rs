//! Running extra commands inside a live container.

use std::process::Command;

use burrow_common::error::{BurrowError, Result};
use burrow_core::namespace::Namespace;

/// Output from an exec command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Standard output from the command.
    pub stdout: String,
    /// Standard error from the command.
    pub stderr: String,
    /// Exit code returned by the command.
    pub exit_code: i32,
}

/// Builds the `nsenter` arguments that join every namespace of `pid`,
/// including its root and working directory, and run `command`.
#[must_use]
pub fn nsenter_args(pid: u32, command: &[String]) -> Vec<String> {
    let mut args: Vec<String> = vec!["--target".into(), pid.to_string()];
    args.extend(Namespace::ALL.iter().map(|ns| ns.nsenter_flag().to_owned()));
    args.extend(["--root", "--wd", "--"].iter().map(ToString::to_string));
    args.extend(command.iter().cloned());
    args
}

/// Joins the namespaces of the container whose init is `pid` and runs
/// `command` there, capturing its output.
///
/// # Errors
///
/// Returns an error if the command is empty, `nsenter` is not installed,
/// or it cannot be started.
pub fn exec_in_container(name: &str, pid: u32, command: &[String]) -> Result<ExecOutput> {
    if command.is_empty() {
        return Err(BurrowError::config("exec command is empty"));
    }
    let nsenter = which::which("nsenter").map_err(|e| BurrowError::Command {
        command: "nsenter".into(),
        message: format!("not found on PATH: {e}"),
    })?;
    tracing::info!(name, pid, cmd = ?command, "exec into container");

    let output = Command::new(&nsenter)
        .args(nsenter_args(pid, command))
        .output()
        .map_err(|e| BurrowError::io(&nsenter, e))?;

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}
