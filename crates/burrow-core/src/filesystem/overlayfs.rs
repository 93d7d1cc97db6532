//! `OverlayFS` management for layered container filesystems.
//!
//! Stacks a read-only image layer under a single writable upper layer,
//! giving each container a copy-on-write view of a shared image.

use std::path::PathBuf;

use burrow_common::error::{BurrowError, Result};

/// Configuration for an `OverlayFS` mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Read-only lower layers (top to bottom).
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper layer directory.
    pub upper_dir: PathBuf,
    /// Work directory required by `OverlayFS`.
    pub work_dir: PathBuf,
    /// Final merged mount point.
    pub merged_dir: PathBuf,
}

impl OverlayConfig {
    /// Renders the `lowerdir=..,upperdir=..,workdir=..` mount data string.
    #[must_use]
    pub fn options(&self) -> String {
        let lowers = self
            .lower_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        format!(
            "lowerdir={},upperdir={},workdir={}",
            lowers,
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }
}

/// Mounts an `OverlayFS` with the given configuration.
///
/// The upper, work, and merged directories must already exist.
///
/// # Errors
///
/// Returns an error if the mount syscall fails.
#[cfg(target_os = "linux")]
pub fn mount_overlay(config: &OverlayConfig) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    let opts = config.options();
    mount(
        Some("overlay"),
        &config.merged_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    )
    .map_err(|e| BurrowError::PermissionDenied {
        message: format!(
            "overlay mount at {} failed: {e}",
            config.merged_dir.display()
        ),
    })?;

    tracing::info!(merged = %config.merged_dir.display(), "overlayfs mounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: `OverlayFS` mounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_overlay(_config: &OverlayConfig) -> Result<()> {
    Err(BurrowError::config("Linux required for native container operations"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_join_lowers_and_name_upper_and_work() {
        let config = OverlayConfig {
            lower_dirs: vec![PathBuf::from("/img/base"), PathBuf::from("/img/extra")],
            upper_dir: PathBuf::from("/ws/c1/upper"),
            work_dir: PathBuf::from("/ws/c1/work"),
            merged_dir: PathBuf::from("/ws/c1/merged"),
        };
        assert_eq!(
            config.options(),
            "lowerdir=/img/base:/img/extra,upperdir=/ws/c1/upper,workdir=/ws/c1/work"
        );
    }
}
