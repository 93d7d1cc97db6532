//! Linux namespace selection for container isolation.
//!
//! Every container is created with the same fixed set of namespaces in a
//! single `clone(2)` call; partial isolation is not supported. `exec`
//! sessions join the same set through `nsenter`.

/// A namespace kind a container is isolated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Hostname and NIS domain name.
    Uts,
    /// Process ID tree; the container init becomes PID 1.
    Pid,
    /// Mount table.
    Mount,
    /// Network stack: interfaces, routes, firewall rules.
    Net,
    /// System V IPC and POSIX message queues.
    Ipc,
}

impl Namespace {
    /// All namespaces a container is created in.
    pub const ALL: [Self; 5] = [Self::Uts, Self::Pid, Self::Mount, Self::Net, Self::Ipc];

    /// The `nsenter(1)` option joining this namespace of a target process.
    #[must_use]
    pub const fn nsenter_flag(self) -> &'static str {
        match self {
            Self::Uts => "--uts",
            Self::Pid => "--pid",
            Self::Mount => "--mount",
            Self::Net => "--net",
            Self::Ipc => "--ipc",
        }
    }

    /// The `clone(2)` flag creating this namespace.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub const fn clone_flag(self) -> nix::sched::CloneFlags {
        use nix::sched::CloneFlags;

        match self {
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::Net => CloneFlags::CLONE_NEWNET,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
        }
    }
}

/// Combined `clone(2)` flags for every namespace in [`Namespace::ALL`].
#[cfg(target_os = "linux")]
#[must_use]
pub fn isolation_flags() -> nix::sched::CloneFlags {
    Namespace::ALL
        .iter()
        .fold(nix::sched::CloneFlags::empty(), |flags, ns| flags | ns.clone_flag())
}
