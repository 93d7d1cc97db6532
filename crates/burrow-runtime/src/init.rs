//! The in-namespace half of a launch, run as `burrow init`.
//!
//! The process is PID 1 of the container. It blocks on the control pipe
//! until the launcher has finished resource and network setup, then
//! switches into the merged root filesystem and replaces itself with the
//! requested command.

use std::convert::Infallible;
use std::ffi::CString;
use std::io::Read;
use std::path::PathBuf;

use burrow_common::constants::CONTROL_FD;
use burrow_common::error::{BurrowError, Result};

use crate::control;

/// Reads the command, prepares the mount namespace and execs the command.
///
/// Only returns on failure.
///
/// # Errors
///
/// Returns an error if the control pipe is unreadable or empty, a mount
/// step fails, or the program cannot be found or executed.
#[cfg(target_os = "linux")]
pub fn run_container_init() -> Result<Infallible> {
    use burrow_core::filesystem::{mount, pivot_root};

    let argv = read_command()?;
    tracing::debug!(command = ?argv, "init received command");

    let root = std::env::current_dir().map_err(|e| BurrowError::io(".", e))?;
    mount::make_mounts_private()?;
    pivot_root::pivot_root(&root)?;
    mount::mount_proc()?;

    let program = resolve_program(&argv[0])?;
    let program = to_c_string(program.into_os_string().into_encoded_bytes())?;
    let args = argv
        .into_iter()
        .map(|a| to_c_string(a.into_bytes()))
        .collect::<Result<Vec<_>>>()?;

    let err = nix::unistd::execv(&program, &args).err();
    Err(BurrowError::Command {
        command: args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" "),
        message: err.map_or_else(|| "exec returned".to_owned(), |e| e.to_string()),
    })
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error.
#[cfg(not(target_os = "linux"))]
pub fn run_container_init() -> Result<Infallible> {
    Err(BurrowError::config("Linux required for native container operations"))
}

/// Reads the whole control message from the inherited descriptor.
fn read_command() -> Result<Vec<String>> {
    use std::os::fd::FromRawFd;

    // SAFETY: the launcher installs the control pipe's read end as
    // CONTROL_FD before exec; nothing else in this process owns it.
    let mut pipe = unsafe { std::fs::File::from_raw_fd(CONTROL_FD) };
    let mut message = String::new();
    let _ = pipe
        .read_to_string(&mut message)
        .map_err(|e| BurrowError::io(format!("fd {CONTROL_FD}"), e))?;
    let argv = control::decode(&message);
    if argv.is_empty() {
        return Err(BurrowError::config("received an empty command from the launcher"));
    }
    Ok(argv)
}

/// Resolves a bare program name on `PATH`; names containing `/` are used
/// as given.
fn resolve_program(name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        return Ok(PathBuf::from(name));
    }
    which::which(name).map_err(|e| BurrowError::NotFound {
        kind: "executable",
        id: format!("{name} ({e})"),
    })
}

fn to_c_string(bytes: Vec<u8>) -> Result<CString> {
    CString::new(bytes).map_err(|e| BurrowError::config(format!("argument contains a NUL byte: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_paths_are_not_searched() {
        assert_eq!(resolve_program("./run.sh").unwrap(), PathBuf::from("./run.sh"));
        assert_eq!(resolve_program("/bin/true").unwrap(), PathBuf::from("/bin/true"));
    }

    #[test]
    fn unknown_programs_are_not_found() {
        let err = resolve_program("burrow-definitely-missing-binary").unwrap_err();
        assert!(err.is_not_found());
    }
}
