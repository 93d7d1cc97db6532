//! Domain primitive types used across the burrow workspace.

use std::fmt;
use std::path::{Component, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BurrowError, Result};

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID (32 lowercase hex characters).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns at most the first `len` characters, for interface names and display.
    #[must_use]
    pub fn short(&self, len: usize) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(len)
            .map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a container as persisted in its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// The container's init process has been started.
    Running,
    /// The container was stopped by an explicit action.
    Stopped,
    /// The container's init process exited on its own.
    Exited,
}

impl ContainerStatus {
    /// Returns whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Only `running -> stopped` and `running -> exited` are permitted.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::Stopped | Self::Exited)
        )
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Desired resource limits, as supplied by the user.
///
/// Both fields are raw strings; an empty string means "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory ceiling, e.g. `100m`, `1GiB`, `268435456`.
    pub memory_limit: String,
    /// CPU share in classic `cpu.shares` units (2..262144).
    pub cpu_share: String,
}

impl ResourceConfig {
    /// Returns `true` when neither limit is set.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.memory_limit.trim().is_empty() && self.cpu_share.trim().is_empty()
    }
}

/// A `hostPath:containerPath` bind-mount request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Directory on the host.
    pub host_path: PathBuf,
    /// Absolute path inside the container's root filesystem.
    pub container_path: PathBuf,
}

impl FromStr for VolumeSpec {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(container), None) if !host.is_empty() && !container.is_empty() => {
                let container_path = PathBuf::from(container);
                if !container_path.is_absolute() {
                    return Err(BurrowError::config(format!(
                        "volume container path must be absolute: {container}"
                    )));
                }
                if container_path.components().any(|c| c == Component::ParentDir) {
                    return Err(BurrowError::config(format!(
                        "volume container path must not contain `..`: {container}"
                    )));
                }
                if !container_path.components().any(|c| matches!(c, Component::Normal(_))) {
                    return Err(BurrowError::config("volume cannot be mounted over the container root"));
                }
                Ok(Self {
                    host_path: PathBuf::from(host),
                    container_path,
                })
            }
            _ => Err(BurrowError::config(format!(
                "invalid volume spec {s:?}, expected hostPath:containerPath"
            ))),
        }
    }
}

impl fmt::Display for VolumeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.host_path.display(),
            self.container_path.display()
        )
    }
}

/// A `hostPort:containerPort` forwarding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the container's network namespace.
    pub container_port: u16,
}

impl FromStr for PortMapping {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BurrowError::config(format!("invalid port mapping {s:?}, expected hostPort:containerPort"));
        let (host, container) = s.split_once(':').ok_or_else(invalid)?;
        let host_port = host.trim().parse::<u16>().map_err(|_| invalid())?;
        let container_port = container.trim().parse::<u16>().map_err(|_| invalid())?;
        if host_port == 0 || container_port == 0 {
            return Err(invalid());
        }
        Ok(Self {
            host_port,
            container_port,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_port, self.container_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_hex() {
        let a = ContainerId::generate();
        let b = ContainerId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn short_id_truncates() {
        let id = ContainerId::new("0123456789abcdef");
        assert_eq!(id.short(6), "012345");
        assert_eq!(ContainerId::new("ab").short(6), "ab");
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ContainerStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }

    #[test]
    fn status_only_leaves_running() {
        use ContainerStatus::{Exited, Running, Stopped};
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Exited));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Exited.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn volume_spec_parses() {
        let v: VolumeSpec = "/data:/mnt/data".parse().unwrap();
        assert_eq!(v.host_path, PathBuf::from("/data"));
        assert_eq!(v.container_path, PathBuf::from("/mnt/data"));
        assert_eq!(v.to_string(), "/data:/mnt/data");
    }

    #[test]
    fn volume_container_path_stays_below_root() {
        assert!("/tmp/v:/../../../../tmp/escape".parse::<VolumeSpec>().is_err());
        assert!("/tmp/v:/mnt/../../etc".parse::<VolumeSpec>().is_err());
        assert!("/tmp/v:/".parse::<VolumeSpec>().is_err());
        assert!("/tmp/v:/./".parse::<VolumeSpec>().is_err());
        assert!("/tmp/v:/srv/./data".parse::<VolumeSpec>().is_ok());
    }

    #[test]
    fn volume_spec_rejects_malformed() {
        assert!("/data".parse::<VolumeSpec>().is_err());
        assert!("/a:/b:/c".parse::<VolumeSpec>().is_err());
        assert!(":/b".parse::<VolumeSpec>().is_err());
        assert!("/a:relative".parse::<VolumeSpec>().is_err());
    }

    #[test]
    fn port_mapping_parses() {
        let p: PortMapping = "8080:80".parse().unwrap();
        assert_eq!(p.host_port, 8080);
        assert_eq!(p.container_port, 80);
        assert_eq!(p.to_string(), "8080:80");
    }

    #[test]
    fn port_mapping_rejects_garbage() {
        assert!("8080".parse::<PortMapping>().is_err());
        assert!("x:80".parse::<PortMapping>().is_err());
        assert!("0:80".parse::<PortMapping>().is_err());
        assert!("70000:80".parse::<PortMapping>().is_err());
    }

    #[test]
    fn empty_resource_config_is_unlimited() {
        assert!(ResourceConfig::default().is_unlimited());
        let limited = ResourceConfig {
            memory_limit: "100m".into(),
            cpu_share: String::new(),
        };
        assert!(!limited.is_unlimited());
    }
}
