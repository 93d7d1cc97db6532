//! Per-container copy-on-write root filesystem.
//!
//! Every container gets `<workspace_root>/<name>/{lower,upper,work,merged}`.
//! `lower` is a symlink to the shared image tree, which is never modified;
//! `upper` and `work` are created fresh and receive every write made
//! through `merged`. Creating the per-container directory claims the name:
//! a second workspace for the same name is refused until the first one is
//! destroyed.

use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use burrow_common::config::RuntimePaths;
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::VolumeSpec;

use super::mount::Mounter;
use super::overlayfs::OverlayConfig;

/// Symlinks followed while resolving a volume target before giving up.
const MAX_SYMLINK_HOPS: usize = 40;

/// The four directories backing one container's root filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    /// Directory containing the four layer directories.
    pub root: PathBuf,
    /// Link to the read-only image layer.
    pub lower: PathBuf,
    /// Writable layer.
    pub upper: PathBuf,
    /// Overlay bookkeeping directory.
    pub work: PathBuf,
    /// Union view used as the container's root.
    pub merged: PathBuf,
}

impl WorkspaceLayout {
    /// Derives the layout of a container from its name.
    #[must_use]
    pub fn for_container(workspace_root: &Path, name: &str) -> Self {
        let root = workspace_root.join(name);
        Self {
            lower: root.join("lower"),
            upper: root.join("upper"),
            work: root.join("work"),
            merged: root.join("merged"),
            root,
        }
    }
}

/// Builds and tears down container root filesystems.
pub struct FilesystemWorkspace {
    workspace_root: PathBuf,
    image_root: PathBuf,
    mounter: Arc<dyn Mounter>,
}

impl std::fmt::Debug for FilesystemWorkspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemWorkspace")
            .field("workspace_root", &self.workspace_root)
            .field("image_root", &self.image_root)
            .finish_non_exhaustive()
    }
}

impl FilesystemWorkspace {
    /// Creates a workspace manager over the configured roots.
    #[must_use]
    pub fn new(paths: &RuntimePaths, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            workspace_root: paths.workspace_root.clone(),
            image_root: paths.image_root.clone(),
            mounter,
        }
    }

    /// Returns the layout for a container name.
    #[must_use]
    pub fn layout(&self, name: &str) -> WorkspaceLayout {
        WorkspaceLayout::for_container(&self.workspace_root, name)
    }

    /// Assembles the root filesystem for `name` from `image` and returns
    /// the merged path.
    ///
    /// If a volume is given it is bind-mounted inside the merged view after
    /// the union mount exists. On failure everything created so far is
    /// torn down again; a workspace that already existed is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::AlreadyExists`] if `name` already has a
    /// workspace, and an error if the image is missing, a directory cannot
    /// be created, a volume target leaves the container root, or a mount
    /// fails.
    pub fn create(&self, volume: Option<&VolumeSpec>, image: &str, name: &str) -> Result<PathBuf> {
        let image_dir = self.image_dir(image)?;
        let layout = self.layout(name);
        self.claim(&layout, name)?;

        if let Err(e) = self.assemble(&layout, &image_dir, volume) {
            tracing::warn!(name, error = %e, "workspace creation failed, rolling back");
            self.destroy(volume, name);
            return Err(e);
        }
        tracing::info!(name, image, merged = %layout.merged.display(), "workspace created");
        Ok(layout.merged)
    }

    /// Tears down the root filesystem of `name` in reverse creation order:
    /// volume, union mount, writable layers, then the layout directory.
    ///
    /// Failures are logged and never abort the teardown, except that the
    /// writable layers are kept when the union view could not be unmounted.
    /// Calling this more than once is harmless.
    pub fn destroy(&self, volume: Option<&VolumeSpec>, name: &str) {
        let layout = self.layout(name);

        if let Some(volume) = volume {
            match resolve_in_root(&layout.merged, &volume.container_path) {
                Ok(target) => {
                    if let Err(e) = self.mounter.unmount(&target) {
                        tracing::warn!(name, target = %target.display(), error = %e, "volume unmount failed");
                    }
                }
                Err(e) => tracing::warn!(name, volume = %volume, error = %e, "could not locate volume target"),
            }
        }

        if let Err(e) = self.mounter.unmount(&layout.merged) {
            tracing::warn!(
                name,
                merged = %layout.merged.display(),
                error = %e,
                "overlay unmount failed, keeping writable layer"
            );
            return;
        }

        for dir in [&layout.upper, &layout.work, &layout.merged] {
            remove_dir_tree(dir);
        }
        match std::fs::remove_file(&layout.lower) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %layout.lower.display(), error = %e, "could not remove image link");
            }
        }
        match std::fs::remove_dir(&layout.root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %layout.root.display(),
                error = %e,
                "could not remove workspace directory"
            ),
        }
        tracing::info!(name, "workspace destroyed");
    }

    fn image_dir(&self, image: &str) -> Result<PathBuf> {
        if image.is_empty() || image.contains('/') || image == "." || image == ".." {
            return Err(BurrowError::config(format!("invalid image name {image:?}")));
        }
        let dir = self.image_root.join(image);
        if !dir.is_dir() {
            return Err(BurrowError::NotFound {
                kind: "image",
                id: dir.display().to_string(),
            });
        }
        dir.canonicalize().map_err(|e| BurrowError::io(&dir, e))
    }

    /// Creates the per-container directory, failing if it already exists.
    fn claim(&self, layout: &WorkspaceLayout, name: &str) -> Result<()> {
        create_dir(&self.workspace_root)?;
        match std::fs::create_dir(&layout.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(BurrowError::AlreadyExists {
                kind: "workspace",
                id: name.to_owned(),
            }),
            Err(e) => Err(BurrowError::io(&layout.root, e)),
        }
    }

    fn assemble(
        &self,
        layout: &WorkspaceLayout,
        image_dir: &Path,
        volume: Option<&VolumeSpec>,
    ) -> Result<()> {
        std::os::unix::fs::symlink(image_dir, &layout.lower).map_err(|e| BurrowError::io(&layout.lower, e))?;
        for dir in [&layout.upper, &layout.work, &layout.merged] {
            create_dir(dir)?;
        }

        self.mounter.mount_overlay(&OverlayConfig {
            lower_dirs: vec![image_dir.to_path_buf()],
            upper_dir: layout.upper.clone(),
            work_dir: layout.work.clone(),
            merged_dir: layout.merged.clone(),
        })?;

        if let Some(volume) = volume {
            create_dir(&volume.host_path)?;
            let target = volume_target(&layout.merged, volume)?;
            self.mounter.bind_mount(&volume.host_path, &target)?;
            tracing::info!(volume = %volume, "volume mounted");
        }
        Ok(())
    }
}

fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| BurrowError::io(path, e))
}

/// Creates the bind target of `volume` inside `merged` and returns it.
///
/// The target must still lie inside `merged` once created.
fn volume_target(merged: &Path, volume: &VolumeSpec) -> Result<PathBuf> {
    let target = resolve_in_root(merged, &volume.container_path)?;
    create_dir(&target)?;
    let root = merged.canonicalize().map_err(|e| BurrowError::io(merged, e))?;
    let resolved = target.canonicalize().map_err(|e| BurrowError::io(&target, e))?;
    if !resolved.starts_with(&root) {
        return Err(BurrowError::config(format!(
            "volume target {} resolves outside the container root",
            volume.container_path.display()
        )));
    }
    Ok(target)
}

/// Resolves `path` the way the container will see it with `root` as `/`.
///
/// Symlinks are read and followed relative to `root`, and `..` stops at
/// `root`, so the result never names a host path outside of it. Missing
/// components are joined as they are.
fn resolve_in_root(root: &Path, path: &Path) -> Result<PathBuf> {
    let mut pending: Vec<OsString> = Vec::new();
    push_components(&mut pending, path);

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    let mut hops = 0usize;
    while let Some(part) = pending.pop() {
        if part == OsStr::new("..") {
            if depth > 0 {
                let _ = resolved.pop();
                depth -= 1;
            }
            continue;
        }
        let candidate = resolved.join(&part);
        let is_link = std::fs::symlink_metadata(&candidate).is_ok_and(|m| m.file_type().is_symlink());
        if !is_link {
            resolved = candidate;
            depth += 1;
            continue;
        }
        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return Err(BurrowError::config(format!(
                "too many symbolic links resolving {}",
                path.display()
            )));
        }
        let link = std::fs::read_link(&candidate).map_err(|e| BurrowError::io(&candidate, e))?;
        if link.is_absolute() {
            resolved = root.to_path_buf();
            depth = 0;
        }
        push_components(&mut pending, &link);
    }
    Ok(resolved)
}

/// Pushes the named components of `path` onto `stack` so the first one is
/// popped first.
fn push_components(stack: &mut Vec<OsString>, path: &Path) {
    let parts: Vec<OsString> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
        })
        .collect();
    stack.extend(parts.into_iter().rev());
}

fn remove_dir_tree(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove directory"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records mount calls instead of touching the kernel.
    #[derive(Default)]
    struct FakeMounter {
        calls: Mutex<Vec<String>>,
        fail_overlay: bool,
        fail_unmount: bool,
        /// Symlinks `(name, target)` that appear in the merged view once
        /// mounted, standing in for links shipped by the image.
        image_links: Vec<(&'static str, PathBuf)>,
    }

    impl FakeMounter {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Mounter for FakeMounter {
        fn mount_overlay(&self, config: &OverlayConfig) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("overlay {}", config.merged_dir.display()));
            if self.fail_overlay {
                return Err(BurrowError::PermissionDenied {
                    message: "overlay refused".into(),
                });
            }
            for (name, target) in &self.image_links {
                std::os::unix::fs::symlink(target, config.merged_dir.join(name)).expect("image link");
            }
            Ok(())
        }

        fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("bind {} {}", source.display(), target.display()));
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("umount {}", target.display()));
            if self.fail_unmount {
                return Err(BurrowError::PermissionDenied {
                    message: "busy".into(),
                });
            }
            Ok(())
        }
    }

    fn setup(mounter: FakeMounter) -> (tempfile::TempDir, RuntimePaths, Arc<FakeMounter>, FilesystemWorkspace) {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RuntimePaths::under(dir.path());
        let image = paths.image_dir("base");
        std::fs::create_dir_all(image.join("bin")).expect("image dir");
        std::fs::write(image.join("bin/hello"), "hi").expect("image file");
        let mounter = Arc::new(mounter);
        let ws = FilesystemWorkspace::new(&paths, mounter.clone());
        (dir, paths, mounter, ws)
    }

    #[test]
    fn layout_is_derived_from_name() {
        let layout = WorkspaceLayout::for_container(Path::new("/ws"), "c1");
        assert_eq!(layout.lower, PathBuf::from("/ws/c1/lower"));
        assert_eq!(layout.upper, PathBuf::from("/ws/c1/upper"));
        assert_eq!(layout.work, PathBuf::from("/ws/c1/work"));
        assert_eq!(layout.merged, PathBuf::from("/ws/c1/merged"));
    }

    #[test]
    fn create_builds_all_layers_and_mounts_overlay() {
        let (_dir, paths, mounter, ws) = setup(FakeMounter::default());
        let merged = ws.create(None, "base", "c1").expect("create");
        let layout = ws.layout("c1");

        assert_eq!(merged, layout.merged);
        assert!(layout.upper.is_dir());
        assert!(layout.work.is_dir());
        assert!(layout.merged.is_dir());
        let target = std::fs::read_link(&layout.lower).expect("lower is a link");
        assert_eq!(target, paths.image_dir("base").canonicalize().unwrap());
        assert_eq!(mounter.calls(), vec![format!("overlay {}", merged.display())]);
    }

    #[test]
    fn destroy_removes_layers_but_keeps_image() {
        let (_dir, paths, _mounter, ws) = setup(FakeMounter::default());
        let _ = ws.create(None, "base", "c1").expect("create");
        ws.destroy(None, "c1");

        let layout = ws.layout("c1");
        assert!(!layout.upper.exists());
        assert!(!layout.work.exists());
        assert!(!layout.merged.exists());
        assert!(std::fs::symlink_metadata(&layout.lower).is_err());
        assert!(!layout.root.exists());
        assert!(paths.image_dir("base").join("bin/hello").exists());
    }

    #[test]
    fn destroy_twice_is_harmless() {
        let (_dir, _paths, _mounter, ws) = setup(FakeMounter::default());
        let _ = ws.create(None, "base", "c1").expect("create");
        ws.destroy(None, "c1");
        ws.destroy(None, "c1");
        assert!(!ws.layout("c1").root.exists());
    }

    #[test]
    fn volume_is_bound_after_overlay_and_unbound_first() {
        let (dir, _paths, mounter, ws) = setup(FakeMounter::default());
        let host = dir.path().join("data");
        let volume = VolumeSpec {
            host_path: host.clone(),
            container_path: PathBuf::from("/mnt/data"),
        };
        let merged = ws.create(Some(&volume), "base", "c1").expect("create");
        let target = merged.join("mnt/data");
        assert!(host.is_dir());
        assert!(target.is_dir());

        ws.destroy(Some(&volume), "c1");
        let calls = mounter.calls();
        assert_eq!(
            calls,
            vec![
                format!("overlay {}", merged.display()),
                format!("bind {} {}", host.display(), target.display()),
                format!("umount {}", target.display()),
                format!("umount {}", merged.display()),
            ]
        );
        assert!(host.is_dir(), "host side of a volume is never removed");
    }

    #[test]
    fn missing_image_fails_without_creating_layout() {
        let (_dir, _paths, mounter, ws) = setup(FakeMounter::default());
        let err = ws.create(None, "ghost", "c1").unwrap_err();
        assert!(err.is_not_found());
        assert!(!ws.layout("c1").root.exists());
        assert!(mounter.calls().is_empty());
    }

    #[test]
    fn image_names_cannot_escape_the_image_root() {
        let (_dir, _paths, _mounter, ws) = setup(FakeMounter::default());
        assert!(ws.create(None, "../etc", "c1").is_err());
        assert!(ws.create(None, "..", "c1").is_err());
    }

    #[test]
    fn overlay_failure_rolls_back_directories() {
        let (_dir, _paths, _mounter, ws) = setup(FakeMounter {
            fail_overlay: true,
            ..FakeMounter::default()
        });
        assert!(ws.create(None, "base", "c1").is_err());
        let layout = ws.layout("c1");
        assert!(!layout.upper.exists());
        assert!(!layout.root.exists());
    }

    #[test]
    fn failed_overlay_unmount_keeps_writable_layer() {
        let (_dir, _paths, _mounter, ws) = setup(FakeMounter {
            fail_unmount: true,
            ..FakeMounter::default()
        });
        let _ = ws.create(None, "base", "c1").expect("create");
        ws.destroy(None, "c1");
        assert!(ws.layout("c1").upper.is_dir());
    }

    #[test]
    fn existing_workspace_is_left_untouched() {
        let (_dir, _paths, mounter, ws) = setup(FakeMounter::default());
        let _ = ws.create(None, "base", "web").expect("create");
        let layout = ws.layout("web");
        std::fs::write(layout.upper.join("important.db"), "rows").expect("write");

        let err = ws.create(None, "base", "web").unwrap_err();
        assert!(matches!(err, BurrowError::AlreadyExists { kind: "workspace", .. }));
        assert_eq!(
            std::fs::read_to_string(layout.upper.join("important.db")).expect("data kept"),
            "rows"
        );
        assert_eq!(mounter.calls().len(), 1, "no second overlay is stacked");
    }

    #[test]
    fn name_is_free_again_after_destroy() {
        let (_dir, _paths, _mounter, ws) = setup(FakeMounter::default());
        let _ = ws.create(None, "base", "c1").expect("create");
        ws.destroy(None, "c1");
        let _ = ws.create(None, "base", "c1").expect("create again");
    }

    #[test]
    fn absolute_image_link_is_resolved_inside_the_root() {
        let outside = tempfile::tempdir().expect("tempdir");
        let (dir, _paths, mounter, ws) = setup(FakeMounter {
            image_links: vec![("mnt", outside.path().to_path_buf())],
            ..FakeMounter::default()
        });
        let volume = VolumeSpec {
            host_path: dir.path().join("data"),
            container_path: PathBuf::from("/mnt/data"),
        };
        let merged = ws.create(Some(&volume), "base", "c1").expect("create");

        assert!(!outside.path().join("data").exists(), "host directory created outside the root");
        let relative = outside.path().strip_prefix("/").expect("absolute");
        let target = merged.join(relative).join("data");
        assert!(target.is_dir());
        assert!(mounter.calls().contains(&format!("bind {} {}", volume.host_path.display(), target.display())));

        ws.destroy(Some(&volume), "c1");
        assert!(mounter.calls().contains(&format!("umount {}", target.display())));
    }

    #[test]
    fn relative_image_link_cannot_climb_out() {
        let (dir, _paths, mounter, ws) = setup(FakeMounter {
            image_links: vec![("up", PathBuf::from("../../../../../../.."))],
            ..FakeMounter::default()
        });
        let volume = VolumeSpec {
            host_path: dir.path().join("data"),
            container_path: PathBuf::from("/up/escape_target"),
        };
        let merged = ws.create(Some(&volume), "base", "c1").expect("create");
        let target = merged.join("escape_target");
        assert!(target.is_dir());
        assert!(!dir.path().join("escape_target").exists());
        assert!(mounter.calls().contains(&format!("bind {} {}", volume.host_path.display(), target.display())));
    }

    #[test]
    fn parent_components_stop_at_the_root() {
        let (dir, _paths, _mounter, ws) = setup(FakeMounter::default());
        let volume = VolumeSpec {
            host_path: dir.path().join("data"),
            container_path: PathBuf::from("/../../../../escape_target"),
        };
        let merged = ws.create(Some(&volume), "base", "c1").expect("create");
        assert!(merged.join("escape_target").is_dir());
        assert!(!dir.path().join("escape_target").exists());
    }

    #[test]
    fn symlink_loops_are_rejected_and_rolled_back() {
        let (dir, _paths, _mounter, ws) = setup(FakeMounter {
            image_links: vec![("a", PathBuf::from("b")), ("b", PathBuf::from("a"))],
            ..FakeMounter::default()
        });
        let volume = VolumeSpec {
            host_path: dir.path().join("data"),
            container_path: PathBuf::from("/a/x"),
        };
        assert!(ws.create(Some(&volume), "base", "c1").is_err());
        assert!(!ws.layout("c1").root.exists());
    }
}
