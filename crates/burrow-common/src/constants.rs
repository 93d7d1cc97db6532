//! System-wide constants and default paths.

/// Default directory holding per-container metadata (`config.json`, logs).
pub const DEFAULT_STATE_ROOT: &str = "/var/run/burrow";

/// Default directory holding per-container overlay workspaces.
pub const DEFAULT_WORKSPACE_ROOT: &str = "/var/lib/burrow/containers";

/// Default directory holding pre-extracted image trees, one per image name.
pub const DEFAULT_IMAGE_ROOT: &str = "/var/lib/burrow/images";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Default directory holding network definitions, IPAM state, and endpoints.
pub const DEFAULT_NETWORK_ROOT: &str = "/var/run/burrow/network";

/// Name of the serialized container record inside its metadata directory.
pub const CONFIG_NAME: &str = "config.json";

/// Name of the background-mode stdout capture inside the metadata directory.
pub const LOG_FILE: &str = "container.log";

/// Argument that makes the binary enter in-namespace init mode.
pub const INIT_ARG: &str = "init";

/// Descriptor number at which the child inherits the control pipe's read end.
pub const CONTROL_FD: i32 = 3;

/// Name of the network created by default when none has been defined.
pub const DEFAULT_NETWORK_NAME: &str = "bridge0";

/// Subnet of the default network.
pub const DEFAULT_NETWORK_SUBNET: &str = "172.29.0.0/24";

/// Sub-directory of the cgroup root under which container groups live.
pub const CGROUP_PARENT: &str = "burrow";

/// Seconds `stop` waits after SIGTERM before sending SIGKILL.
pub const STOP_GRACE_SECS: u64 = 5;

/// Application name used in CLI output and state files.
pub const APP_NAME: &str = "burrow";
