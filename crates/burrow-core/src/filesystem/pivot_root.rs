//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`.

use std::path::Path;

use burrow_common::error::{BurrowError, Result};

/// Directory (relative to the new root) that briefly holds the old root.
const PUT_OLD: &str = ".pivot_root";

/// Switches the root filesystem to `new_root` using `pivot_root(2)`.
///
/// `new_root` is first bind-mounted onto itself so it is a mount point,
/// the old root is parked in `new_root/.pivot_root`, and is then detached
/// and removed. On return the working directory is `/`.
///
/// Must run inside a private mount namespace.
///
/// # Errors
///
/// Returns an error if any of the mount, pivot, or cleanup steps fail.
#[cfg(target_os = "linux")]
pub fn pivot_root(new_root: &Path) -> Result<()> {
    use nix::mount::{MntFlags, MsFlags, mount, umount2};
    use nix::unistd::chdir;

    tracing::info!(new_root = %new_root.display(), "performing pivot_root");

    mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| BurrowError::PermissionDenied {
        message: format!("bind mount of new root failed: {e}"),
    })?;

    let put_old = new_root.join(PUT_OLD);
    std::fs::create_dir_all(&put_old).map_err(|e| BurrowError::io(&put_old, e))?;

    nix::unistd::pivot_root(new_root, &put_old).map_err(|e| BurrowError::PermissionDenied {
        message: format!("pivot_root failed: {e}"),
    })?;
    chdir("/").map_err(|e| BurrowError::PermissionDenied {
        message: format!("chdir to new root failed: {e}"),
    })?;

    let old_root = Path::new("/").join(PUT_OLD);
    umount2(&old_root, MntFlags::MNT_DETACH).map_err(|e| BurrowError::PermissionDenied {
        message: format!("detaching old root failed: {e}"),
    })?;
    std::fs::remove_dir(&old_root).map_err(|e| BurrowError::io(&old_root, e))?;

    tracing::debug!("old root detached");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: `pivot_root` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn pivot_root(_new_root: &Path) -> Result<()> {
    Err(BurrowError::config("Linux required for native container operations"))
}
