//! Cgroups v2 resource management.
//!
//! A [`ResourceController`] owns exactly one group,
//! `<cgroup_root>/burrow/<container_id>`. Limits are staged with
//! [`ResourceController::configure`] before any process exists, attached to a
//! live PID with [`ResourceController::apply`], and removed with
//! [`ResourceController::destroy`], which is safe to call at any point.

pub mod cpu;
pub mod memory;

use std::fmt;
use std::path::{Path, PathBuf};

use burrow_common::constants::CGROUP_PARENT;
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::ResourceConfig;

/// One resource-limiting subsystem of the unified hierarchy.
pub trait Subsystem: fmt::Debug + Send + Sync {
    /// Controller name as it appears in `cgroup.subtree_control`.
    fn name(&self) -> &'static str;

    /// Writes this subsystem's limits into the group directory.
    ///
    /// Unset fields in `config` must leave the group unconstrained.
    ///
    /// # Errors
    ///
    /// Returns an error if the limit is malformed or cannot be written.
    fn set(&self, group: &Path, config: &ResourceConfig) -> Result<()>;
}

/// Returns the subsystems every container group is configured with.
#[must_use]
pub fn default_subsystems() -> Vec<Box<dyn Subsystem>> {
    vec![Box::new(cpu::CpuSubsystem), Box::new(memory::MemorySubsystem)]
}

/// Handle to the cgroup of a single container.
#[derive(Debug)]
pub struct ResourceController {
    /// Path to this container's cgroup directory.
    path: PathBuf,
    subsystems: Vec<Box<dyn Subsystem>>,
    configured: bool,
}

impl ResourceController {
    /// Creates a controller for the given container; nothing touches the
    /// filesystem until [`configure`](Self::configure).
    #[must_use]
    pub fn new(cgroup_root: &Path, container_id: &str) -> Self {
        Self {
            path: cgroup_root.join(CGROUP_PARENT).join(container_id),
            subsystems: default_subsystems(),
            configured: false,
        }
    }

    /// Returns the group directory managed by this controller.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stages the limits by creating the group and writing control files.
    ///
    /// When no limit is requested the group is not created at all and a
    /// later [`apply`](Self::apply) is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is malformed, or the group directory or a
    /// control file cannot be written.
    pub fn configure(&mut self, config: &ResourceConfig) -> Result<()> {
        let _ = cpu::parse_cpu_share(&config.cpu_share)?;
        let _ = memory::parse_memory(&config.memory_limit)?;
        if config.is_unlimited() {
            tracing::debug!(path = %self.path.display(), "no resource limits requested");
            return Ok(());
        }

        std::fs::create_dir_all(&self.path).map_err(|e| BurrowError::io(&self.path, e))?;
        self.configured = true;
        self.enable_controllers();

        for subsystem in &self.subsystems {
            subsystem.set(&self.path, config)?;
            tracing::debug!(subsystem = subsystem.name(), "subsystem configured");
        }
        tracing::info!(path = %self.path.display(), "cgroup configured");
        Ok(())
    }

    /// Moves a process into the configured group.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.procs` fails.
    pub fn apply(&self, pid: u32) -> Result<()> {
        if !self.configured {
            tracing::debug!(pid, "no cgroup configured, process left unconstrained");
            return Ok(());
        }
        let procs_path = self.path.join("cgroup.procs");
        std::fs::write(&procs_path, pid.to_string()).map_err(|e| BurrowError::io(&procs_path, e))?;
        tracing::info!(pid, path = %self.path.display(), "process attached to cgroup");
        Ok(())
    }

    /// Removes the group and releases its resources.
    ///
    /// Succeeds when the group was never created or is already gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the group still exists and cannot be removed,
    /// typically because processes are still attached.
    pub fn destroy(&mut self) -> Result<()> {
        self.configured = false;
        // cgroupfs only allows rmdir; plain directories (tests) need recursion.
        match std::fs::remove_dir(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
                std::fs::remove_dir_all(&self.path).map_err(|e| BurrowError::io(&self.path, e))?;
            }
            Err(e) => return Err(BurrowError::io(&self.path, e)),
        }
        tracing::info!(path = %self.path.display(), "cgroup destroyed");
        Ok(())
    }

    /// Enables this controller's subsystems for children of the parent group.
    fn enable_controllers(&self) {
        let Some(parent) = self.path.parent() else {
            return;
        };
        // Only real cgroupfs directories carry `cgroup.controllers`.
        if !parent.join("cgroup.controllers").exists() {
            return;
        }
        let wanted = self
            .subsystems
            .iter()
            .map(|s| format!("+{}", s.name()))
            .collect::<Vec<_>>()
            .join(" ");
        let control = parent.join("cgroup.subtree_control");
        if let Err(e) = std::fs::write(&control, &wanted) {
            tracing::warn!(path = %control.display(), error = %e, "could not enable controllers");
        }
    }
}
