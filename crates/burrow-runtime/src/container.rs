//! The persisted description of one container.

use chrono::Local;
use serde::{Deserialize, Serialize};

use burrow_common::error::{BurrowError, Result};
use burrow_common::types::{ContainerId, ContainerStatus, PortMapping, VolumeSpec};

/// Timestamp format of [`ContainerRecord::created_time`].
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Identity and runtime state of a container, as stored in `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Host-visible PID of the container's init process.
    pub pid: String,
    /// Random identifier, fixed for the container's lifetime.
    pub id: ContainerId,
    /// User-chosen name, or the id.
    pub name: String,
    /// Requested argument vector joined with spaces.
    pub command: String,
    /// Local creation time, formatted with [`TIME_FORMAT`].
    #[serde(rename = "createTime")]
    pub created_time: String,
    /// Lifecycle status.
    pub status: ContainerStatus,
    /// `hostPath:containerPath` volume binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    /// `hostPort:containerPort` entries, in request order.
    #[serde(rename = "portmapping", default)]
    pub port_mapping: Vec<String>,
}

impl ContainerRecord {
    /// Builds the record of a container that has just been started.
    #[must_use]
    pub fn running(
        id: ContainerId,
        name: &str,
        pid: u32,
        command: &[String],
        volume: Option<&VolumeSpec>,
        ports: &[PortMapping],
    ) -> Self {
        Self {
            pid: pid.to_string(),
            id,
            name: name.to_owned(),
            command: command.join(" "),
            created_time: Local::now().format(TIME_FORMAT).to_string(),
            status: ContainerStatus::Running,
            volume: volume.map(ToString::to_string),
            port_mapping: ports.iter().map(ToString::to_string).collect(),
        }
    }

    /// The init PID as a number, if the stored value is valid.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid.parse().ok().filter(|pid| *pid > 0)
    }

    /// The volume binding, parsed back into a [`VolumeSpec`].
    ///
    /// # Errors
    ///
    /// Returns an error if the stored binding is malformed.
    pub fn volume_spec(&self) -> Result<Option<VolumeSpec>> {
        self.volume.as_deref().map(str::parse).transpose()
    }

    /// Moves the record to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::InvalidTransition`] unless the change is
    /// `running -> stopped` or `running -> exited`.
    pub fn transition(&mut self, next: ContainerStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BurrowError::InvalidTransition {
                name: self.name.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(name = %self.name, from = %self.status, to = %next, "status transition");
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ContainerRecord {
        ContainerRecord::running(
            ContainerId::new("0123abcd"),
            "c1",
            4242,
            &["echo".into(), "hi".into()],
            None,
            &["8080:80".parse().unwrap()],
        )
    }

    #[test]
    fn new_record_is_running_with_joined_command() {
        let r = record();
        assert_eq!(r.status, ContainerStatus::Running);
        assert_eq!(r.command, "echo hi");
        assert_eq!(r.pid(), Some(4242));
        assert_eq!(r.port_mapping, vec!["8080:80"]);
        assert!(chrono::NaiveDateTime::parse_from_str(&r.created_time, TIME_FORMAT).is_ok());
    }

    #[test]
    fn serializes_with_on_disk_field_names() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["pid"], "4242");
        assert_eq!(json["status"], "running");
        assert!(json.get("createTime").is_some());
        assert_eq!(json["portmapping"][0], "8080:80");
        assert!(json.get("volume").is_none());
    }

    #[test]
    fn volume_round_trips_through_the_record() {
        let volume: VolumeSpec = "/srv/data:/data".parse().unwrap();
        let r = ContainerRecord::running(ContainerId::new("x"), "x", 1, &["sh".into()], Some(&volume), &[]);
        assert_eq!(r.volume.as_deref(), Some("/srv/data:/data"));
        assert_eq!(r.volume_spec().unwrap(), Some(volume));
    }

    #[test]
    fn only_forward_transitions_are_allowed() {
        let mut r = record();
        r.transition(ContainerStatus::Stopped).expect("running -> stopped");
        let err = r.transition(ContainerStatus::Running).unwrap_err();
        assert!(matches!(err, BurrowError::InvalidTransition { .. }));
        assert!(r.transition(ContainerStatus::Exited).is_err());
        assert_eq!(r.status, ContainerStatus::Stopped);
    }

    #[test]
    fn invalid_pid_reads_as_none() {
        let mut r = record();
        r.pid = String::new();
        assert_eq!(r.pid(), None);
    }
}
