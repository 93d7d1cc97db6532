//! Container log access.
//!
//! Background containers write their standard output and error to
//! `<state_root>/<name>/container.log`; foreground containers have no log.

use std::fs::{File, OpenOptions};
use std::path::Path;

use burrow_common::error::{BurrowError, Result};

use crate::state::MetadataStore;

/// Creates (or truncates) the log file of `name`, creating the container's
/// metadata directory first.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created.
pub fn create_log(store: &MetadataStore, name: &str) -> Result<File> {
    let dir = store.container_dir(name);
    std::fs::create_dir_all(&dir).map_err(|e| BurrowError::io(&dir, e))?;
    let path = store.log_file(name);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| BurrowError::io(&path, e))?;
    tracing::debug!(name, path = %path.display(), "log file created");
    Ok(file)
}

/// Reads the captured output of `name`.
///
/// Returns an empty string if the container exists but has no log yet
/// (for example because it runs in the foreground).
///
/// # Errors
///
/// Returns [`BurrowError::NotFound`] if the container is unknown, or an
/// error if the log exists but cannot be read.
pub fn read_logs(store: &MetadataStore, name: &str) -> Result<String> {
    if !store.container_dir(name).is_dir() {
        return Err(BurrowError::NotFound {
            kind: "container",
            id: name.to_owned(),
        });
    }
    read_if_exists(&store.log_file(name))
}

fn read_if_exists(path: &Path) -> Result<String> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(BurrowError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use burrow_common::config::RuntimePaths;

    use super::*;

    fn store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MetadataStore::new(&RuntimePaths::under(dir.path()));
        (dir, store)
    }

    #[test]
    fn log_lives_in_the_container_directory() {
        let (_dir, store) = store();
        let mut file = create_log(&store, "c1").expect("create");
        writeln!(file, "hi").expect("write");
        assert_eq!(store.log_file("c1"), store.container_dir("c1").join("container.log"));
        assert_eq!(read_logs(&store, "c1").expect("read"), "hi\n");
    }

    #[test]
    fn missing_log_of_known_container_is_empty() {
        let (_dir, store) = store();
        std::fs::create_dir_all(store.container_dir("fg")).expect("mkdir");
        assert!(read_logs(&store, "fg").expect("read").is_empty());
    }

    #[test]
    fn unknown_container_is_not_found() {
        let (_dir, store) = store();
        assert!(read_logs(&store, "ghost").unwrap_err().is_not_found());
    }

    #[test]
    fn create_truncates_previous_output() {
        let (_dir, store) = store();
        let mut file = create_log(&store, "c1").expect("create");
        writeln!(file, "old").expect("write");
        drop(file);
        let _ = create_log(&store, "c1").expect("recreate");
        assert!(read_logs(&store, "c1").expect("read").is_empty());
    }

    #[test]
    fn log_creation_fails_when_state_root_is_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut paths = RuntimePaths::under(dir.path());
        paths.state_root = dir.path().join("blocker");
        std::fs::write(&paths.state_root, "").expect("write");
        let store = MetadataStore::new(&paths);
        assert!(create_log(&store, "c1").is_err());
    }
}
