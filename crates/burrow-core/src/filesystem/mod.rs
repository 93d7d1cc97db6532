//! Filesystem management for container isolation.
//!
//! Provides the per-container `OverlayFS` workspace, volume bind mounts,
//! `pivot_root` for the in-namespace init, and mount utilities.

pub mod mount;
pub mod overlayfs;
pub mod pivot_root;
pub mod workspace;
