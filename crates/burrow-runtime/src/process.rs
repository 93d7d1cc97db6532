//! Creation of a container's first process.
//!
//! The child is created with one `clone(2)` carrying every namespace flag,
//! so it is PID 1 of a fresh PID namespace from the start. It re-executes
//! the runtime binary with the `init` argument, working directory set to
//! the merged root, and the read end of the control pipe as descriptor 3.
//!
//! Between `clone` and `execve` the child only makes raw, async-signal-safe
//! libc calls on data prepared beforehand. An exec failure is reported back
//! through a close-on-exec status pipe, so [`spawn`] either returns a child
//! that is running the init program or an error.

use std::ffi::{CString, OsString};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use burrow_common::constants::{CONTROL_FD, INIT_ARG};
use burrow_common::error::{BurrowError, Result};

use crate::control;

/// Stack size of the cloned child before it execs.
const STACK_SIZE: usize = 1024 * 1024;

/// Exit status of a child whose bootstrap failed before exec.
const BOOTSTRAP_FAILED: isize = 127;

/// Where the child's standard streams go.
#[derive(Debug)]
pub enum ChildStdio {
    /// Share the launcher's terminal.
    Inherit,
    /// Standard output and error to this file, standard input from
    /// `/dev/null`.
    Log(File),
}

/// Everything needed to start a container's init.
#[derive(Debug)]
pub struct SpawnSpec {
    /// Program to execute; normally the runtime binary itself.
    pub program: PathBuf,
    /// Working directory of the child, the merged root filesystem.
    pub workdir: PathBuf,
    /// Hostname inside the new UTS namespace.
    pub hostname: String,
    /// `KEY=VALUE` overrides on top of the launcher's environment.
    pub env: Vec<(String, String)>,
    /// Standard stream wiring.
    pub stdio: ChildStdio,
}

/// Handle to a started container init.
#[derive(Debug)]
pub struct ContainerProcess {
    pid: u32,
}

impl ContainerProcess {
    /// Host-visible PID of the child.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Blocks until the child exits and returns its exit code; death by
    /// signal `n` is reported as `128 + n`.
    ///
    /// # Errors
    ///
    /// Returns an error if the child cannot be waited for.
    #[cfg(target_os = "linux")]
    pub fn wait(&self) -> Result<i32> {
        use nix::errno::Errno;
        use nix::sys::wait::{WaitStatus, waitpid};

        let pid = nix_pid(self.pid);
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    return Err(BurrowError::PermissionDenied {
                        message: format!("waiting for pid {} failed: {e}", self.pid),
                    });
                }
            }
        }
    }

    /// Stub for non-Linux platforms.
    ///
    /// # Errors
    ///
    /// Always returns an error.
    #[cfg(not(target_os = "linux"))]
    pub fn wait(&self) -> Result<i32> {
        Err(BurrowError::config("Linux required for native container operations"))
    }

    /// Sends `SIGKILL` to the child. A child that is already gone is not
    /// an error.
    #[cfg(target_os = "linux")]
    pub fn kill(&self) {
        use nix::sys::signal::{Signal, kill};

        if let Err(e) = kill(nix_pid(self.pid), Signal::SIGKILL) {
            tracing::debug!(pid = self.pid, error = %e, "kill failed");
        }
    }

    /// Stub for non-Linux platforms.
    #[cfg(not(target_os = "linux"))]
    pub const fn kill(&self) {}
}

/// Write end of the control pipe, held by the launcher.
#[derive(Debug)]
pub struct ControlWriter {
    file: File,
}

impl ControlWriter {
    /// Hands `argv` to the waiting init and closes the pipe.
    ///
    /// # Errors
    ///
    /// Returns an error if the child is gone or the write fails.
    pub fn send(mut self, argv: &[String]) -> Result<()> {
        let message = control::encode(argv);
        self.file
            .write_all(message.as_bytes())
            .map_err(|e| BurrowError::io("control pipe", e))?;
        tracing::debug!(command = %message, "command written to control pipe");
        Ok(())
    }
}

#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_wrap)]
fn nix_pid(pid: u32) -> nix::unistd::Pid {
    nix::unistd::Pid::from_raw(pid as i32)
}

/// Path of the running executable, used as the default init program.
///
/// # Errors
///
/// Returns an error if `/proc/self/exe` cannot be resolved.
pub fn current_executable() -> Result<PathBuf> {
    std::env::current_exe().map_err(|e| BurrowError::io("/proc/self/exe", e))
}

/// Builds `KEY=VALUE` strings: the current environment with `overrides`
/// replacing or extending it.
fn environment(overrides: &[(String, String)]) -> Result<Vec<CString>> {
    let mut vars: Vec<(OsString, OsString)> = std::env::vars_os()
        .filter(|(k, _)| !overrides.iter().any(|(o, _)| k.as_os_str() == o.as_str()))
        .collect();
    vars.extend(overrides.iter().map(|(k, v)| (k.into(), v.into())));
    vars.into_iter()
        .map(|(k, v)| {
            let mut entry = k;
            entry.push("=");
            entry.push(v);
            c_string(entry.into_vec())
        })
        .collect()
}

fn c_string(bytes: Vec<u8>) -> Result<CString> {
    CString::new(bytes).map_err(|e| BurrowError::config(format!("value contains a NUL byte: {e}")))
}

fn path_c_string(path: &Path) -> Result<CString> {
    c_string(path.as_os_str().to_owned().into_vec())
}

/// Starts the container init described by `spec`.
///
/// The returned [`ControlWriter`] must be used to release the child; until
/// then it blocks reading its command.
///
/// # Errors
///
/// Returns an error if the pipes cannot be created, `clone(2)` is refused,
/// or the child cannot exec `spec.program`.
#[cfg(target_os = "linux")]
pub fn spawn(spec: SpawnSpec) -> Result<(ContainerProcess, ControlWriter)> {
    use nix::fcntl::OFlag;
    use nix::sys::signal::Signal;
    use nix::unistd::pipe2;

    let program = path_c_string(&spec.program)?;
    let workdir = path_c_string(&spec.workdir)?;
    let hostname = spec.hostname.clone().into_bytes();
    let arg0 = program.clone();
    let arg1 = c_string(INIT_ARG.as_bytes().to_vec())?;
    let env = environment(&spec.env)?;

    let argv_ptrs = [arg0.as_ptr(), arg1.as_ptr(), std::ptr::null()];
    let mut envp_ptrs: Vec<*const libc::c_char> = env.iter().map(|e| e.as_ptr()).collect();
    envp_ptrs.push(std::ptr::null());

    let pipe_err = |e: nix::errno::Errno| BurrowError::PermissionDenied {
        message: format!("pipe creation failed: {e}"),
    };
    let (control_read, control_write) = pipe2(OFlag::O_CLOEXEC).map_err(pipe_err)?;
    let (status_read, status_write) = pipe2(OFlag::O_CLOEXEC).map_err(pipe_err)?;

    let (stdout_fd, stdin_null) = match &spec.stdio {
        ChildStdio::Inherit => (None, None),
        ChildStdio::Log(file) => {
            let null = File::open("/dev/null").map_err(|e| BurrowError::io("/dev/null", e))?;
            (Some(file.as_raw_fd()), Some(null))
        }
    };
    let stdin_fd = stdin_null.as_ref().map(AsRawFd::as_raw_fd);
    let control_fd = control_read.as_raw_fd();
    let status_fd = status_write.as_raw_fd();

    let child = move || -> isize {
        // SAFETY: only async-signal-safe libc calls on descriptors and
        // C strings prepared before clone(2); this copy of the address
        // space is replaced by execve or ends with the returned status.
        unsafe {
            bootstrap_child(
                ChildFds {
                    stdout: stdout_fd,
                    stdin: stdin_fd,
                    control: control_fd,
                    status: status_fd,
                },
                &hostname,
                &workdir,
                &argv_ptrs,
                &envp_ptrs,
            )
        }
    };

    let mut stack = vec![0_u8; STACK_SIZE];
    let flags = burrow_core::namespace::isolation_flags();
    // SAFETY: the child callback does not touch locks or the allocator; it
    // only uses the values moved into it, which outlive the call.
    let pid = unsafe { nix::sched::clone(Box::new(child), &mut stack, flags, Some(Signal::SIGCHLD as i32)) }
        .map_err(|e| BurrowError::PermissionDenied {
            message: format!("clone with namespace isolation failed: {e}"),
        })?;
    let process = ContainerProcess {
        pid: u32::try_from(pid.as_raw()).map_err(|_| BurrowError::config("clone returned an invalid pid"))?,
    };

    drop(control_read);
    drop(status_write);
    drop(stdin_null);
    drop(spec.stdio);

    if let Some(errno) = read_exec_status(status_read) {
        let _ = process.wait();
        return Err(BurrowError::Command {
            command: format!("{} {INIT_ARG}", spec.program.display()),
            message: format!("container init could not start: {}", nix::errno::Errno::from_raw(errno)),
        });
    }

    tracing::info!(pid = process.pid, program = %spec.program.display(), "container process started");
    Ok((
        process,
        ControlWriter {
            file: File::from(control_write),
        },
    ))
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error.
#[cfg(not(target_os = "linux"))]
pub fn spawn(_spec: SpawnSpec) -> Result<(ContainerProcess, ControlWriter)> {
    Err(BurrowError::config("Linux required for native container operations"))
}

/// Reads the child's exec report: end-of-file means exec succeeded,
/// otherwise the child wrote its `errno`.
fn read_exec_status(status_read: OwnedFd) -> Option<i32> {
    let mut file = File::from(status_read);
    let mut buf = [0_u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    (filled == buf.len()).then(|| i32::from_ne_bytes(buf))
}

/// Descriptors the cloned child rearranges before exec.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
struct ChildFds {
    stdout: Option<i32>,
    stdin: Option<i32>,
    control: i32,
    status: i32,
}

/// Runs in the cloned child: wires descriptors, names the UTS namespace,
/// enters the merged root and execs the init program. Returns only on
/// failure.
///
/// # Safety
///
/// Must only be called in a freshly cloned child. `argv` and `envp` must
/// be null-terminated arrays of valid C strings.
#[cfg(target_os = "linux")]
unsafe fn bootstrap_child(
    fds: ChildFds,
    hostname: &[u8],
    workdir: &CString,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> isize {
    let ChildFds {
        stdout: stdout_fd,
        stdin: stdin_fd,
        control: control_fd,
        status: mut status_fd,
    } = fds;
    unsafe {
        let fail = |status_fd: i32| -> isize {
            let errno = nix::errno::Errno::last_raw();
            let bytes = errno.to_ne_bytes();
            let _ = libc::write(status_fd, bytes.as_ptr().cast(), bytes.len());
            BOOTSTRAP_FAILED
        };

        if let Some(out) = stdout_fd {
            if libc::dup2(out, libc::STDOUT_FILENO) < 0 || libc::dup2(out, libc::STDERR_FILENO) < 0 {
                return fail(status_fd);
            }
        }
        if let Some(input) = stdin_fd {
            if libc::dup2(input, libc::STDIN_FILENO) < 0 {
                return fail(status_fd);
            }
        }

        // Keep the status pipe out of the way of the control descriptor.
        if status_fd == CONTROL_FD {
            status_fd = libc::fcntl(status_fd, libc::F_DUPFD_CLOEXEC, CONTROL_FD + 1);
            if status_fd < 0 {
                return BOOTSTRAP_FAILED;
            }
        }
        if control_fd == CONTROL_FD {
            if libc::fcntl(CONTROL_FD, libc::F_SETFD, 0) < 0 {
                return fail(status_fd);
            }
        } else if libc::dup2(control_fd, CONTROL_FD) < 0 {
            return fail(status_fd);
        }

        if !hostname.is_empty() && libc::sethostname(hostname.as_ptr().cast(), hostname.len()) < 0 {
            return fail(status_fd);
        }
        if libc::chdir(workdir.as_ptr()) < 0 {
            return fail(status_fd);
        }
        // Only returns on failure.
        let _ = libc::execve(argv[0], argv.as_ptr(), envp.as_ptr());
        fail(status_fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_applies_overrides() {
        let env = environment(&[("BURROW_TEST_VAR".into(), "1".into()), ("PATH".into(), "/bin".into())])
            .expect("environment");
        let env: Vec<String> = env.into_iter().map(|c| c.into_string().unwrap()).collect();
        assert!(env.contains(&"BURROW_TEST_VAR=1".to_owned()));
        assert_eq!(env.iter().filter(|e| e.starts_with("PATH=")).count(), 1);
        assert!(env.contains(&"PATH=/bin".to_owned()));
    }

    #[test]
    fn nul_bytes_are_rejected() {
        assert!(environment(&[("K".into(), "a\0b".into())]).is_err());
    }

    #[test]
    fn short_status_read_means_exec_succeeded() {
        let (read, write) = nix::unistd::pipe().expect("pipe");
        drop(write);
        assert_eq!(read_exec_status(read), None);
    }

    #[test]
    fn full_status_read_carries_errno() {
        let (read, write) = nix::unistd::pipe().expect("pipe");
        let mut w = File::from(write);
        w.write_all(&libc::ENOENT.to_ne_bytes()).expect("write");
        drop(w);
        assert_eq!(read_exec_status(read), Some(libc::ENOENT));
    }
}
