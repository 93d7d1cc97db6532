//! # burrow-core
//!
//! Low-level Linux isolation primitives for the burrow runtime.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: the UTS, PID, mount, network, and IPC flag set used
//!   for every container.
//! - **Cgroups v2**: CPU and memory limiting through [`cgroup::ResourceController`].
//! - **Filesystem**: `OverlayFS` workspaces, volume bind mounts, and `pivot_root`.
//! - **Network**: bridges, veth pairs, address allocation, and port forwarding.
//!
//! Kernel-facing seams ([`filesystem::mount::Mounter`],
//! [`network::host::HostNetwork`]) are traits so callers can substitute
//! fakes when running without privileges.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod network;
