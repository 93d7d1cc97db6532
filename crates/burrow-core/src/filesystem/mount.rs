//! Mount utilities for container filesystem setup.
//!
//! Host-side mounts (overlay, volume binds) go through the [`Mounter`]
//! trait so the workspace can be exercised without `CAP_SYS_ADMIN`.
//! The in-namespace helpers ([`make_mounts_private`], [`mount_proc`]) are
//! only called by the container's init.

use std::path::Path;

use burrow_common::error::{BurrowError, Result};

use super::overlayfs::{self, OverlayConfig};

/// Host mount operations needed to assemble a container root filesystem.
pub trait Mounter: Send + Sync {
    /// Mounts a union view described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount fails.
    fn mount_overlay(&self, config: &OverlayConfig) -> Result<()>;

    /// Bind-mounts `source` onto `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount fails.
    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()>;

    /// Detaches whatever is mounted at `target`.
    ///
    /// Unmounting a path that is not a mount point succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount exists but cannot be detached.
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// [`Mounter`] backed by the `mount(2)`/`umount2(2)` syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelMounter;

impl Mounter for KernelMounter {
    fn mount_overlay(&self, config: &OverlayConfig) -> Result<()> {
        overlayfs::mount_overlay(config)
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        bind_mount(source, target)
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        unmount(target)
    }
}

/// Creates a recursive bind mount from source to target.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
#[cfg(target_os = "linux")]
pub fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| BurrowError::PermissionDenied {
        message: format!(
            "bind mount {} -> {} failed: {e}",
            source.display(),
            target.display()
        ),
    })?;
    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        "bind mount created"
    );
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: bind mounts require Linux.
#[cfg(not(target_os = "linux"))]
pub fn bind_mount(_source: &Path, _target: &Path) -> Result<()> {
    Err(BurrowError::config("Linux required for native container operations"))
}

/// Lazily detaches the filesystem mounted at `target`.
///
/// `EINVAL` (not a mount point) and `ENOENT` (path gone) count as success,
/// which keeps teardown idempotent.
///
/// # Errors
///
/// Returns an error for any other `umount2(2)` failure.
#[cfg(target_os = "linux")]
pub fn unmount(target: &Path) -> Result<()> {
    use nix::errno::Errno;
    use nix::mount::{MntFlags, umount2};

    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) => {
            tracing::debug!(path = %target.display(), "unmounted");
            Ok(())
        }
        Err(Errno::EINVAL | Errno::ENOENT) => {
            tracing::debug!(path = %target.display(), "nothing mounted");
            Ok(())
        }
        Err(e) => Err(BurrowError::PermissionDenied {
            message: format!("unmount {} failed: {e}", target.display()),
        }),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: unmounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn unmount(_target: &Path) -> Result<()> {
    Err(BurrowError::config("Linux required for native container operations"))
}

/// Marks every mount in the current namespace private (recursively), so
/// nothing the container mounts propagates back to the host.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
#[cfg(target_os = "linux")]
pub fn make_mounts_private() -> Result<()> {
    use nix::mount::{MsFlags, mount};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| BurrowError::PermissionDenied {
        message: format!("making mounts private failed: {e}"),
    })?;
    tracing::debug!("mount propagation set to private");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: mount namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn make_mounts_private() -> Result<()> {
    Err(BurrowError::config("Linux required for native container operations"))
}

/// Mounts a fresh `proc` filesystem at `/proc` inside the container.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the mount fails.
#[cfg(target_os = "linux")]
pub fn mount_proc() -> Result<()> {
    use nix::mount::{MsFlags, mount};

    let target = Path::new("/proc");
    std::fs::create_dir_all(target).map_err(|e| BurrowError::io(target, e))?;
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|e| BurrowError::PermissionDenied {
        message: format!("mounting /proc failed: {e}"),
    })?;
    tracing::debug!("/proc mounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: `/proc` is Linux-only.
#[cfg(not(target_os = "linux"))]
pub fn mount_proc() -> Result<()> {
    Err(BurrowError::config("Linux required for native container operations"))
}
