//! Launching containers.
//!
//! A launch runs in a fixed order: root filesystem, log file (background
//! only), process start, metadata record, resource limits, network
//! attachment, and finally the command hand-off that lets the container's
//! init exec the user command. Errors are handled by stage:
//!
//! - Before and at process start every failure is fatal and rolls back
//!   what was already created.
//! - Resource and network failures after start are degraded: they are
//!   returned in [`LaunchReport::degraded`] while the container keeps
//!   running, unless [`PostStartPolicy::Strict`] is configured.
//! - Teardown never fails; problems are logged.

use std::path::PathBuf;
use std::sync::Arc;

use burrow_common::config::{BurrowConfig, PostStartPolicy, RuntimePaths};
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::{ContainerId, ContainerStatus, PortMapping, ResourceConfig, VolumeSpec};
use burrow_core::cgroup::ResourceController;
use burrow_core::filesystem::mount::Mounter;
use burrow_core::filesystem::workspace::FilesystemWorkspace;
use burrow_core::network::{AttachRequest, HostNetwork, NetworkConnector};

use crate::container::ContainerRecord;
use crate::logs;
use crate::process::{self, ChildStdio, ContainerProcess, SpawnSpec};
use crate::state::MetadataStore;

/// Longest accepted container name.
const MAX_NAME_LEN: usize = 64;

/// User-facing options of one launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Foreground mode: share the terminal and wait for exit.
    pub tty: bool,
    /// Container name; defaults to the generated id.
    pub name: Option<String>,
    /// Requested limits.
    pub resources: ResourceConfig,
    /// `hostPath:containerPath` volume binding.
    pub volume: Option<String>,
    /// Network to attach to.
    pub network: Option<String>,
    /// `KEY=VALUE` environment overrides.
    pub env: Vec<String>,
    /// `hostPort:containerPort` mappings; require a network.
    pub port_mappings: Vec<String>,
}

/// Outcome of a successful launch.
#[derive(Debug)]
pub struct LaunchReport {
    /// The record as written at start.
    pub record: ContainerRecord,
    /// Post-start failures the container is running despite.
    pub degraded: Vec<BurrowError>,
    /// Exit code of a foreground container.
    pub exit_code: Option<i32>,
}

/// Options after validation.
struct Plan {
    id: ContainerId,
    name: String,
    volume: Option<VolumeSpec>,
    ports: Vec<PortMapping>,
    env: Vec<(String, String)>,
}

/// Starts containers and sequences their supporting resources.
pub struct ContainerLauncher {
    paths: RuntimePaths,
    policy: PostStartPolicy,
    store: MetadataStore,
    workspace: FilesystemWorkspace,
    network: NetworkConnector,
    init_program: Option<PathBuf>,
}

impl std::fmt::Debug for ContainerLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerLauncher")
            .field("paths", &self.paths)
            .field("policy", &self.policy)
            .field("init_program", &self.init_program)
            .finish_non_exhaustive()
    }
}

impl ContainerLauncher {
    /// Creates a launcher over `config`, using `mounter` and `host` for
    /// kernel work.
    #[must_use]
    pub fn new(config: &BurrowConfig, mounter: Arc<dyn Mounter>, host: Arc<dyn HostNetwork>) -> Self {
        Self {
            paths: config.paths.clone(),
            policy: config.post_start,
            store: MetadataStore::new(&config.paths),
            workspace: FilesystemWorkspace::new(&config.paths, mounter),
            network: NetworkConnector::new(&config.paths, config.network.clone(), host),
            init_program: None,
        }
    }

    /// Re-executes `program` instead of the running binary.
    #[must_use]
    pub fn with_init_program(mut self, program: PathBuf) -> Self {
        self.init_program = Some(program);
        self
    }

    /// The metadata store the launcher records into.
    #[must_use]
    pub const fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// The root filesystem manager.
    #[must_use]
    pub const fn workspace(&self) -> &FilesystemWorkspace {
        &self.workspace
    }

    /// The network connector.
    #[must_use]
    pub const fn network(&self) -> &NetworkConnector {
        &self.network
    }

    /// Launches `command` in a new container built from `image`.
    ///
    /// In foreground mode this blocks until the container exits and tears
    /// it down; in background mode it returns once the command has been
    /// handed to the container.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::AlreadyExists`] if a container or workspace
    /// named like this one is still present; nothing of it is touched.
    /// Otherwise returns an error if the options are invalid, the root
    /// filesystem or log cannot be created, the process cannot start, the record cannot
    /// be written, or the command cannot be handed over. With the strict
    /// policy, resource and network failures are errors too.
    pub fn launch(&self, options: &LaunchOptions, image: &str, command: &[String]) -> Result<LaunchReport> {
        let plan = plan(options, command)?;
        let name = plan.name.as_str();
        tracing::info!(id = %plan.id, name, image, tty = options.tty, "launching container");

        if self.store.exists(name) {
            return Err(BurrowError::AlreadyExists {
                kind: "container",
                id: name.to_owned(),
            });
        }
        let merged = self.workspace.create(plan.volume.as_ref(), image, name)?;

        let stdio = if options.tty {
            ChildStdio::Inherit
        } else {
            match logs::create_log(&self.store, name) {
                Ok(file) => ChildStdio::Log(file),
                Err(e) => {
                    self.rollback(&plan);
                    return Err(e);
                }
            }
        };

        let spawned = self.init_program().and_then(|program| {
            process::spawn(SpawnSpec {
                program,
                workdir: merged,
                hostname: name.to_owned(),
                env: plan.env.clone(),
                stdio,
            })
        });
        let (child, control) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::warn!(name, error = %e, "container process failed to start");
                self.rollback(&plan);
                return Err(e);
            }
        };

        let record = ContainerRecord::running(
            plan.id.clone(),
            name,
            child.pid(),
            command,
            plan.volume.as_ref(),
            &plan.ports,
        );
        if let Err(e) = self.store.record(&record) {
            self.abort(&child, &plan, None, false);
            return Err(e);
        }

        let mut controller = ResourceController::new(&self.paths.cgroup_root, plan.id.as_str());
        let mut degraded = Vec::new();
        if let Err(e) = controller
            .configure(&options.resources)
            .and_then(|()| controller.apply(child.pid()))
        {
            tracing::warn!(name, error = %e, "resource limits not applied, container runs unconstrained");
            if let Err(e) = controller.destroy() {
                tracing::warn!(name, error = %e, "could not remove cgroup");
            }
            degraded.push(e);
        }

        if let Some(network) = &options.network {
            let request = AttachRequest {
                id: plan.id.to_string(),
                name: name.to_owned(),
                pid: child.pid(),
                port_mappings: plan.ports.clone(),
            };
            if let Err(e) = self
                .network
                .init_network_subsystem()
                .and_then(|()| self.network.connect(network, &request))
            {
                tracing::warn!(name, network, error = %e, "network attachment failed, container runs unconnected");
                degraded.push(e);
            }
        }

        if self.policy == PostStartPolicy::Strict && !degraded.is_empty() {
            tracing::warn!(name, "strict post-start policy, tearing container down");
            self.abort(&child, &plan, Some(&mut controller), options.network.is_some());
            return Err(degraded.remove(0));
        }

        if let Err(e) = control.send(command) {
            self.abort(&child, &plan, Some(&mut controller), options.network.is_some());
            return Err(e);
        }
        tracing::info!(id = %plan.id, name, pid = child.pid(), "container running");

        let exit_code = if options.tty {
            Some(self.wait_and_teardown(&child, &plan, &mut controller, options.network.is_some()))
        } else {
            None
        };

        Ok(LaunchReport {
            record,
            degraded,
            exit_code,
        })
    }

    fn init_program(&self) -> Result<PathBuf> {
        self.init_program
            .clone()
            .map_or_else(process::current_executable, Ok)
    }

    /// Waits for a foreground container and removes everything it owned.
    fn wait_and_teardown(
        &self,
        child: &ContainerProcess,
        plan: &Plan,
        controller: &mut ResourceController,
        networked: bool,
    ) -> i32 {
        let code = match child.wait() {
            Ok(code) => code,
            Err(e) => {
                tracing::warn!(name = %plan.name, error = %e, "wait failed");
                -1
            }
        };
        tracing::info!(name = %plan.name, code, "container exited");
        if let Err(e) = self.store.update_status(&plan.name, ContainerStatus::Exited) {
            tracing::warn!(name = %plan.name, error = %e, "could not record exit");
        }
        self.teardown(plan, Some(controller), networked);
        code
    }

    /// Kills a started container and removes everything it owned.
    fn abort(
        &self,
        child: &ContainerProcess,
        plan: &Plan,
        controller: Option<&mut ResourceController>,
        networked: bool,
    ) {
        child.kill();
        if let Err(e) = child.wait() {
            tracing::warn!(name = %plan.name, error = %e, "could not reap aborted container");
        }
        self.teardown(plan, controller, networked);
    }

    /// Removes what exists before a process is started.
    fn rollback(&self, plan: &Plan) {
        tracing::debug!(name = %plan.name, "rolling back launch");
        self.store.delete(&plan.name);
        self.workspace.destroy(plan.volume.as_ref(), &plan.name);
    }

    fn teardown(&self, plan: &Plan, controller: Option<&mut ResourceController>, networked: bool) {
        if networked {
            if let Err(e) = self.network.disconnect(&plan.name) {
                tracing::warn!(name = %plan.name, error = %e, "could not disconnect network");
            }
        }
        if let Some(controller) = controller {
            if let Err(e) = controller.destroy() {
                tracing::warn!(name = %plan.name, error = %e, "could not remove cgroup");
            }
        }
        self.rollback(plan);
    }
}

/// Validates `options` and `command` before anything is created.
fn plan(options: &LaunchOptions, command: &[String]) -> Result<Plan> {
    if command.iter().all(String::is_empty) {
        return Err(BurrowError::config("no command given"));
    }
    let id = ContainerId::generate();
    let name = match &options.name {
        Some(name) => {
            validate_name(name)?;
            name.clone()
        }
        None => id.to_string(),
    };
    let volume = options.volume.as_deref().map(str::parse).transpose()?;
    let ports = options
        .port_mappings
        .iter()
        .map(|p| p.parse())
        .collect::<Result<Vec<PortMapping>>>()?;
    if !ports.is_empty() && options.network.is_none() {
        return Err(BurrowError::config("port mappings require a network (--net)"));
    }
    let env = options
        .env
        .iter()
        .map(|e| parse_env(e))
        .collect::<Result<Vec<_>>>()?;
    Ok(Plan {
        id,
        name,
        volume,
        ports,
        env,
    })
}

/// Container names key directories, so they must be single path components.
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(BurrowError::config(format!(
            "invalid container name {name:?}: use up to {MAX_NAME_LEN} of [A-Za-z0-9_.-]"
        )))
    }
}

fn parse_env(entry: &str) -> Result<(String, String)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(BurrowError::config(format!(
            "invalid environment entry {entry:?}, expected KEY=VALUE"
        ))),
    }
}
