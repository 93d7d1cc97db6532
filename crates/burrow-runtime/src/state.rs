//! Persistent container metadata.
//!
//! Each container owns `<state_root>/<name>/`, holding `config.json` (its
//! [`ContainerRecord`]) and, for background containers, `container.log`.
//! Nothing else is shared between containers, so concurrent launches with
//! different names never touch the same files. A name already present here
//! is refused at launch; two launches racing on a fresh name are serialized
//! by the workspace claim, so only one of them reaches the store.

use std::path::{Path, PathBuf};

use burrow_common::config::RuntimePaths;
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::ContainerStatus;

use crate::container::ContainerRecord;

/// Reads and writes container records under the state root.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    paths: RuntimePaths,
}

impl MetadataStore {
    /// Creates a store over `paths.state_root`.
    #[must_use]
    pub fn new(paths: &RuntimePaths) -> Self {
        Self {
            paths: paths.clone(),
        }
    }

    /// Directory holding everything recorded for `name`.
    #[must_use]
    pub fn container_dir(&self, name: &str) -> PathBuf {
        self.paths.container_dir(name)
    }

    /// Path of the background-mode output capture for `name`.
    #[must_use]
    pub fn log_file(&self, name: &str) -> PathBuf {
        self.paths.log_file(name)
    }

    /// Persists `record`, creating its directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn record(&self, record: &ContainerRecord) -> Result<()> {
        let dir = self.container_dir(&record.name);
        std::fs::create_dir_all(&dir).map_err(|e| BurrowError::io(&dir, e))?;

        let path = self.paths.config_file(&record.name);
        let tmp = dir.join(format!(".config.json.{}", std::process::id()));
        let data = serde_json::to_vec_pretty(record)?;
        std::fs::write(&tmp, data).map_err(|e| BurrowError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| BurrowError::io(&path, e))?;

        tracing::debug!(name = %record.name, status = %record.status, path = %path.display(), "record written");
        Ok(())
    }

    /// Loads the record of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::NotFound`] if no record exists, or an error if
    /// it cannot be read or parsed.
    pub fn load(&self, name: &str) -> Result<ContainerRecord> {
        let path = self.paths.config_file(name);
        match std::fs::read_to_string(&path) {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BurrowError::NotFound {
                kind: "container",
                id: name.to_owned(),
            }),
            Err(e) => Err(BurrowError::io(&path, e)),
        }
    }

    /// Whether a record exists for `name`.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.paths.config_file(name).is_file()
    }

    /// All records, sorted by creation time then name.
    ///
    /// Directories without a record (for example a container whose launch
    /// is in progress) are skipped; unreadable records are logged and
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the state root exists but cannot be listed.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let root = &self.paths.state_root;
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BurrowError::io(root, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BurrowError::io(root, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !self.exists(&name) {
                continue;
            }
            match self.load(&name) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(name, error = %e, "skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| {
            a.created_time
                .cmp(&b.created_time)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(records)
    }

    /// Rewrites the status of `name`, enforcing the allowed transitions.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing, the transition is not
    /// allowed, or the file cannot be written.
    pub fn update_status(&self, name: &str, status: ContainerStatus) -> Result<ContainerRecord> {
        let mut record = self.load(name)?;
        record.transition(status)?;
        self.record(&record)?;
        tracing::info!(name, %status, "container status updated");
        Ok(record)
    }

    /// Removes everything recorded for `name`.
    ///
    /// Failures are logged and otherwise ignored so teardown always
    /// completes.
    pub fn delete(&self, name: &str) {
        let dir = self.container_dir(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => tracing::debug!(name, path = %dir.display(), "metadata removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(name, path = %dir.display(), error = %e, "could not remove metadata"),
        }
    }

    /// The state root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.paths.state_root
    }
}

#[cfg(test)]
mod tests {
    use burrow_common::types::ContainerId;

    use super::*;

    fn store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MetadataStore::new(&RuntimePaths::under(dir.path()));
        (dir, store)
    }

    fn record(name: &str) -> ContainerRecord {
        ContainerRecord::running(
            ContainerId::generate(),
            name,
            100,
            &["sleep".into(), "10".into()],
            None,
            &[],
        )
    }

    #[test]
    fn record_then_load_round_trips() {
        let (_dir, store) = store();
        let r = record("c1");
        store.record(&r).expect("record");
        assert!(store.exists("c1"));
        assert_eq!(store.load("c1").expect("load"), r);
        assert!(store.container_dir("c1").join("config.json").is_file());
    }

    #[test]
    fn load_of_unknown_container_is_not_found() {
        let (_dir, store) = store();
        assert!(store.load("ghost").unwrap_err().is_not_found());
    }

    #[test]
    fn list_skips_directories_without_records() {
        let (_dir, store) = store();
        store.record(&record("a")).unwrap();
        store.record(&record("b")).unwrap();
        std::fs::create_dir_all(store.container_dir("half-launched")).unwrap();

        let names: Vec<_> = store.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn list_of_missing_root_is_empty() {
        let (_dir, store) = store();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn update_status_enforces_transitions() {
        let (_dir, store) = store();
        store.record(&record("c1")).unwrap();
        let r = store.update_status("c1", ContainerStatus::Exited).unwrap();
        assert_eq!(r.status, ContainerStatus::Exited);
        assert!(store.update_status("c1", ContainerStatus::Stopped).is_err());
        assert_eq!(store.load("c1").unwrap().status, ContainerStatus::Exited);
    }

    #[test]
    fn same_name_is_last_writer_wins() {
        let (_dir, store) = store();
        let first = record("dup");
        let second = record("dup");
        store.record(&first).unwrap();
        store.record(&second).unwrap();
        assert_eq!(store.load("dup").unwrap().id, second.id);
    }

    #[test]
    fn delete_removes_directory_and_is_idempotent() {
        let (_dir, store) = store();
        store.record(&record("c1")).unwrap();
        std::fs::write(store.log_file("c1"), "out").unwrap();
        store.delete("c1");
        assert!(!store.container_dir("c1").exists());
        store.delete("c1");
    }
}
