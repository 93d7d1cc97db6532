//! Runtime configuration model.
//!
//! All filesystem locations live in a single [`RuntimePaths`] value that is
//! handed to every component at construction, so any component can be run
//! against a temporary root in tests.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{BurrowError, Result};

/// Filesystem roots used by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimePaths {
    /// Per-container metadata directories (`<state_root>/<name>/config.json`).
    pub state_root: PathBuf,
    /// Per-container overlay workspaces (`<workspace_root>/<name>/{lower,upper,work,merged}`).
    pub workspace_root: PathBuf,
    /// Pre-extracted image trees (`<image_root>/<image>`).
    pub image_root: PathBuf,
    /// Cgroup v2 mount point.
    pub cgroup_root: PathBuf,
    /// Network definitions, IPAM state, and endpoints.
    pub network_root: PathBuf,
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from(constants::DEFAULT_STATE_ROOT),
            workspace_root: PathBuf::from(constants::DEFAULT_WORKSPACE_ROOT),
            image_root: PathBuf::from(constants::DEFAULT_IMAGE_ROOT),
            cgroup_root: PathBuf::from(constants::CGROUP_V2_PATH),
            network_root: PathBuf::from(constants::DEFAULT_NETWORK_ROOT),
        }
    }
}

impl RuntimePaths {
    /// Lays every runtime directory out beneath `root`.
    ///
    /// The cgroup root is left untouched since it is a kernel mount point.
    #[must_use]
    pub fn under(root: &Path) -> Self {
        Self {
            state_root: root.join("run"),
            workspace_root: root.join("containers"),
            image_root: root.join("images"),
            cgroup_root: PathBuf::from(constants::CGROUP_V2_PATH),
            network_root: root.join("network"),
        }
    }

    /// Returns the metadata directory of a container.
    #[must_use]
    pub fn container_dir(&self, name: &str) -> PathBuf {
        self.state_root.join(name)
    }

    /// Returns the path of a container's serialized record.
    #[must_use]
    pub fn config_file(&self, name: &str) -> PathBuf {
        self.container_dir(name).join(constants::CONFIG_NAME)
    }

    /// Returns the path of a container's background-mode log.
    #[must_use]
    pub fn log_file(&self, name: &str) -> PathBuf {
        self.container_dir(name).join(constants::LOG_FILE)
    }

    /// Returns the directory of a pre-extracted image.
    #[must_use]
    pub fn image_dir(&self, image: &str) -> PathBuf {
        self.image_root.join(image)
    }
}

/// What the launcher does when a step after process start fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PostStartPolicy {
    /// Report the failure and keep the container running.
    #[default]
    BestEffort,
    /// Kill the container, tear it down, and fail the launch.
    Strict,
}

/// The network created on first use when no network has been defined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkDefaults {
    /// Network name.
    pub name: String,
    /// Subnet in CIDR notation.
    pub subnet: String,
}

impl Default for NetworkDefaults {
    fn default() -> Self {
        Self {
            name: constants::DEFAULT_NETWORK_NAME.to_string(),
            subnet: constants::DEFAULT_NETWORK_SUBNET.to_string(),
        }
    }
}

/// Root configuration for the burrow runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurrowConfig {
    /// Filesystem roots.
    pub paths: RuntimePaths,
    /// Handling of resource/network failures after start.
    pub post_start: PostStartPolicy,
    /// Default network.
    pub network: NetworkDefaults,
}

impl BurrowConfig {
    /// Loads the configuration from a JSON file.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = serde_json::from_str(&content)?;
                tracing::debug!(path = %path.display(), "loaded configuration");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no configuration file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(BurrowError::io(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_under_rebase_everything_but_cgroups() {
        let paths = RuntimePaths::under(Path::new("/tmp/b"));
        assert_eq!(paths.state_root, PathBuf::from("/tmp/b/run"));
        assert_eq!(paths.cgroup_root, PathBuf::from(constants::CGROUP_V2_PATH));
        assert_eq!(
            paths.config_file("c1"),
            PathBuf::from("/tmp/b/run/c1/config.json")
        );
        assert_eq!(
            paths.log_file("c1"),
            PathBuf::from("/tmp/b/run/c1/container.log")
        );
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = BurrowConfig::load(&dir.path().join("absent.json")).expect("load");
        assert_eq!(config, BurrowConfig::default());
    }

    #[test]
    fn load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("burrow.json");
        std::fs::write(&path, r#"{"post_start":"strict","network":{"name":"lab"}}"#)
            .expect("write");
        let config = BurrowConfig::load(&path).expect("load");
        assert_eq!(config.post_start, PostStartPolicy::Strict);
        assert_eq!(config.network.name, "lab");
        assert_eq!(config.network.subnet, constants::DEFAULT_NETWORK_SUBNET);
        assert_eq!(config.paths, RuntimePaths::default());
    }

    #[test]
    fn load_rejects_malformed_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("burrow.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(BurrowConfig::load(&path).is_err());
    }
}
