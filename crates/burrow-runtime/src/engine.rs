//! Runtime engine that coordinates container operations.
//!
//! [`Engine`] is the entry point used by the CLI: it owns the launcher and
//! adds the management actions that act on recorded containers after
//! launch (`ps`, `logs`, `stop`, `rm`, `exec`) and on networks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_common::config::BurrowConfig;
use burrow_common::constants::STOP_GRACE_SECS;
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::ContainerStatus;
use burrow_core::cgroup::ResourceController;
use burrow_core::filesystem::mount::{KernelMounter, Mounter};
use burrow_core::network::{HostNetwork, IpRoute, Network, Subnet};

use crate::container::ContainerRecord;
use crate::exec::{self, ExecOutput};
use crate::launcher::{ContainerLauncher, LaunchOptions, LaunchReport};
use crate::logs;

/// Interval between liveness checks while stopping a container.
const STOP_POLL: Duration = Duration::from_millis(100);

/// How long a killed init may take to exit, and its cgroup to empty.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// The runtime engine.
#[derive(Debug)]
pub struct Engine {
    config: BurrowConfig,
    launcher: ContainerLauncher,
}

impl Engine {
    /// Creates an engine that mounts through the kernel and configures
    /// networking with the host's `ip`/`iptables` tools.
    #[must_use]
    pub fn new(config: BurrowConfig) -> Self {
        Self::with_parts(config, Arc::new(KernelMounter), Arc::new(IpRoute))
    }

    /// Creates an engine with explicit mount and network backends.
    #[must_use]
    pub fn with_parts(config: BurrowConfig, mounter: Arc<dyn Mounter>, host: Arc<dyn HostNetwork>) -> Self {
        let launcher = ContainerLauncher::new(&config, mounter, host);
        Self { config, launcher }
    }

    /// The configuration the engine was built with.
    #[must_use]
    pub const fn config(&self) -> &BurrowConfig {
        &self.config
    }

    /// Launches a container; see [`ContainerLauncher::launch`].
    ///
    /// # Errors
    ///
    /// Returns an error if the launch fails.
    pub fn launch(&self, options: &LaunchOptions, image: &str, command: &[String]) -> Result<LaunchReport> {
        self.launcher.launch(options, image, command)
    }

    /// All recorded containers.
    ///
    /// Records still marked running whose init has disappeared are
    /// rewritten as exited first.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be listed.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let store = self.launcher.store();
        let mut records = store.list()?;
        for record in &mut records {
            if record.status == ContainerStatus::Running && !record.pid().is_some_and(is_alive) {
                match store.update_status(&record.name, ContainerStatus::Exited) {
                    Ok(updated) => *record = updated,
                    Err(e) => tracing::warn!(name = %record.name, error = %e, "could not reconcile status"),
                }
            }
        }
        Ok(records)
    }

    /// Loads one container record.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::NotFound`] if the container is unknown.
    pub fn inspect(&self, name: &str) -> Result<ContainerRecord> {
        self.launcher.store().load(name)
    }

    /// Stops a running container: `SIGTERM`, then `SIGKILL` after the grace
    /// period. The record becomes `stopped`.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is unknown or not running.
    pub fn stop(&self, name: &str) -> Result<ContainerRecord> {
        let record = self.inspect(name)?;
        if record.status != ContainerStatus::Running {
            return Err(BurrowError::config(format!("container {name} is not running")));
        }
        if let Some(pid) = record.pid() {
            terminate(pid, Duration::from_secs(STOP_GRACE_SECS));
        }
        let record = self.launcher.store().update_status(name, ContainerStatus::Stopped)?;
        tracing::info!(name, "container stopped");
        Ok(record)
    }

    /// Removes a container: network attachment, cgroup, root filesystem
    /// and record.
    ///
    /// A running container is refused unless `force` is set, in which case
    /// it is killed first.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is unknown, running without
    /// `force`, or its record is malformed.
    pub fn remove(&self, name: &str, force: bool) -> Result<()> {
        let record = self.inspect(name)?;
        let alive = record.pid().is_some_and(is_alive);
        if record.status == ContainerStatus::Running && alive {
            if !force {
                return Err(BurrowError::config(format!(
                    "container {name} is running; stop it first or use --force"
                )));
            }
            if let Some(pid) = record.pid() {
                terminate(pid, Duration::ZERO);
            }
        }

        let volume = record.volume_spec()?;
        if let Err(e) = self.launcher.network().disconnect(name) {
            tracing::warn!(name, error = %e, "could not disconnect network");
        }
        let mut controller = ResourceController::new(&self.config.paths.cgroup_root, record.id.as_str());
        destroy_cgroup(&mut controller, name);
        self.launcher.workspace().destroy(volume.as_ref(), name);
        self.launcher.store().delete(name);
        tracing::info!(name, "container removed");
        Ok(())
    }

    /// Captured output of a background container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is unknown or its log unreadable.
    pub fn logs(&self, name: &str) -> Result<String> {
        logs::read_logs(self.launcher.store(), name)
    }

    /// Runs `command` inside a running container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is unknown or not running, or the
    /// command cannot be started.
    pub fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput> {
        let record = self.inspect(name)?;
        let pid = record
            .pid()
            .filter(|pid| record.status == ContainerStatus::Running && is_alive(*pid))
            .ok_or_else(|| BurrowError::config(format!("container {name} is not running")))?;
        exec::exec_in_container(name, pid, command)
    }

    /// Creates a network.
    ///
    /// # Errors
    ///
    /// Returns an error if the network cannot be created.
    pub fn create_network(&self, name: &str, subnet: &str) -> Result<Network> {
        let subnet: Subnet = subnet.parse()?;
        self.launcher.network().create_network(name, subnet)
    }

    /// All networks, creating the default one on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the networks cannot be read or set up.
    pub fn list_networks(&self) -> Result<Vec<Network>> {
        self.launcher.network().init_network_subsystem()?;
        self.launcher.network().list_networks()
    }

    /// Removes a network with no attached containers.
    ///
    /// # Errors
    ///
    /// Returns an error if the network is unknown or in use.
    pub fn remove_network(&self, name: &str) -> Result<()> {
        self.launcher.network().remove_network(name)
    }
}

/// Whether the process `pid` still exists and has not exited.
///
/// An exited process that its new parent has not reaped yet counts as gone.
#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_wrap)]
fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    !matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH)) && !is_zombie(pid)
}

#[cfg(not(target_os = "linux"))]
const fn is_alive(_pid: u32) -> bool {
    false
}

/// Reads the state letter from `/proc/<pid>/stat`; the command name before
/// it is parenthesized and may itself contain spaces or `)`.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
        stat.rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            == Some("Z")
    })
}

/// Polls until `pid` is gone or `timeout` passes; returns whether it is gone.
fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(STOP_POLL);
    }
}

/// Sends `SIGTERM`, waits up to `grace` for the process to go away, then
/// sends `SIGKILL` and waits for the kill to take effect.
#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_wrap)]
fn terminate(pid: u32, grace: Duration) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);
    if !grace.is_zero() {
        if kill(target, Signal::SIGTERM).is_err() {
            return;
        }
        tracing::info!(pid, "sent SIGTERM");
        if wait_for_exit(pid, grace) {
            return;
        }
    }
    if kill(target, Signal::SIGKILL).is_ok() {
        tracing::info!(pid, "sent SIGKILL");
    }
    if !wait_for_exit(pid, KILL_WAIT) {
        tracing::warn!(pid, "process still present after SIGKILL");
    }
}

#[cfg(not(target_os = "linux"))]
const fn terminate(_pid: u32, _grace: Duration) {}

/// Removes a container's cgroup, retrying while the kernel still reports
/// it busy with exiting tasks.
fn destroy_cgroup(controller: &mut ResourceController, name: &str) {
    let deadline = Instant::now() + KILL_WAIT;
    loop {
        match controller.destroy() {
            Ok(()) => return,
            Err(e) if Instant::now() >= deadline => {
                tracing::warn!(name, error = %e, "could not remove cgroup");
                return;
            }
            Err(e) => {
                tracing::debug!(name, error = %e, "cgroup busy, retrying");
                std::thread::sleep(STOP_POLL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::path::Path;

    use burrow_common::config::RuntimePaths;
    use burrow_common::types::ContainerId;
    use burrow_core::filesystem::overlayfs::OverlayConfig;
    use burrow_core::network::portmap::PortForward;

    use super::*;

    struct NoopMounter;

    impl Mounter for NoopMounter {
        fn mount_overlay(&self, _config: &OverlayConfig) -> Result<()> {
            Ok(())
        }
        fn bind_mount(&self, _source: &Path, _target: &Path) -> Result<()> {
            Ok(())
        }
        fn unmount(&self, _target: &Path) -> Result<()> {
            Ok(())
        }
    }

    struct NoopHost;

    impl HostNetwork for NoopHost {
        fn ensure_bridge(&self, _: &str, _: Ipv4Addr, _: &Subnet) -> Result<()> {
            Ok(())
        }
        fn delete_bridge(&self, _: &str, _: &Subnet) -> Result<()> {
            Ok(())
        }
        fn create_veth(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn delete_link(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn move_into_namespace(&self, _: &str, _: u32) -> Result<()> {
            Ok(())
        }
        fn configure_container_interface(&self, _: u32, _: &str, _: Ipv4Addr, _: u8, _: Ipv4Addr) -> Result<()> {
            Ok(())
        }
        fn add_port_forward(&self, _: &PortForward) -> Result<()> {
            Ok(())
        }
        fn remove_port_forward(&self, _: &PortForward) -> Result<()> {
            Ok(())
        }
    }

    fn engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut paths = RuntimePaths::under(dir.path());
        paths.cgroup_root = dir.path().join("cgroup");
        let config = BurrowConfig {
            paths,
            ..BurrowConfig::default()
        };
        let engine = Engine::with_parts(config, Arc::new(NoopMounter), Arc::new(NoopHost));
        (dir, engine)
    }

    /// Writes a running record whose pid cannot exist.
    fn dead_record(engine: &Engine, name: &str) -> ContainerRecord {
        let mut record = ContainerRecord::running(ContainerId::generate(), name, 1, &["sleep".into()], None, &[]);
        record.pid = i32::MAX.to_string();
        engine.launcher.store().record(&record).expect("record");
        record
    }

    #[test]
    fn list_reconciles_dead_running_containers() {
        let (_dir, engine) = engine();
        let _ = dead_record(&engine, "gone");
        let records = engine.list().expect("list");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ContainerStatus::Exited);
        assert_eq!(engine.inspect("gone").unwrap().status, ContainerStatus::Exited);
    }

    #[test]
    fn stop_requires_a_running_container() {
        let (_dir, engine) = engine();
        assert!(engine.stop("ghost").unwrap_err().is_not_found());
        let _ = dead_record(&engine, "c1");
        let _ = engine.list().unwrap();
        assert!(engine.stop("c1").is_err());
    }

    #[test]
    fn stop_of_vanished_process_marks_stopped() {
        let (_dir, engine) = engine();
        let _ = dead_record(&engine, "c1");
        let record = engine.stop("c1").expect("stop");
        assert_eq!(record.status, ContainerStatus::Stopped);
    }

    #[test]
    fn remove_deletes_record_workspace_and_cgroup() {
        let (dir, engine) = engine();
        let record = dead_record(&engine, "c1");
        let cgroup = dir.path().join("cgroup/burrow").join(record.id.as_str());
        std::fs::create_dir_all(&cgroup).unwrap();
        let layout = engine.launcher.workspace().layout("c1");
        std::fs::create_dir_all(&layout.upper).unwrap();

        engine.remove("c1", false).expect("remove");
        assert!(engine.inspect("c1").unwrap_err().is_not_found());
        assert!(!cgroup.exists());
        assert!(!layout.root.exists());
    }

    #[test]
    fn remove_refuses_live_container_without_force() {
        let (_dir, engine) = engine();
        let mut record = ContainerRecord::running(ContainerId::generate(), "me", 1, &["sh".into()], None, &[]);
        record.pid = std::process::id().to_string();
        engine.launcher.store().record(&record).unwrap();
        assert!(engine.remove("me", false).is_err());
        assert!(engine.inspect("me").is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn killed_process_counts_as_gone_before_it_is_reaped() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        child.kill().expect("kill");
        assert!(wait_for_exit(child.id(), Duration::from_secs(2)));
        let _ = child.wait().expect("reap");
    }

    #[test]
    fn live_process_is_not_reported_gone() {
        if cfg!(target_os = "linux") {
            assert!(!wait_for_exit(std::process::id(), Duration::from_millis(150)));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn forced_remove_waits_for_the_kill_before_cleanup() {
        use std::os::unix::process::ExitStatusExt;

        let (dir, engine) = engine();
        let mut child = std::process::Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let mut record = ContainerRecord::running(ContainerId::generate(), "c1", child.id(), &["sleep".into()], None, &[]);
        record.pid = child.id().to_string();
        engine.launcher.store().record(&record).unwrap();
        let cgroup = dir.path().join("cgroup/burrow").join(record.id.as_str());
        std::fs::create_dir_all(&cgroup).unwrap();

        engine.remove("c1", true).expect("forced remove");
        assert!(!is_alive(child.id()), "init must be gone before remove returns");
        assert_eq!(child.wait().expect("reap").signal(), Some(9));
        assert!(!cgroup.exists());
        assert!(engine.inspect("c1").unwrap_err().is_not_found());
    }

    #[test]
    fn logs_of_unknown_container_is_not_found() {
        let (_dir, engine) = engine();
        assert!(engine.logs("ghost").unwrap_err().is_not_found());
    }

    #[test]
    fn exec_requires_a_live_container() {
        let (_dir, engine) = engine();
        let _ = dead_record(&engine, "c1");
        assert!(engine.exec("c1", &["ls".into()]).is_err());
    }

    #[test]
    fn networks_can_be_created_listed_and_removed() {
        let (_dir, engine) = engine();
        let _ = engine.create_network("back", "10.44.0.0/24").expect("create");
        let names: Vec<_> = engine
            .list_networks()
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["back", "bridge0"]);
        engine.remove_network("back").expect("remove");
        assert!(engine.create_network("bad", "not-a-subnet").is_err());
    }
}
