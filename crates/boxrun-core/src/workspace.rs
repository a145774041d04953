//! Per-task workspace isolation.
//!
//! `shared` tasks work directly in the workspace root. `worktree` and
//! `snapshot_ro` tasks get a private copy under a scratch directory; snapshot
//! copies additionally have every write permission bit cleared.

use crate::plan::WorkspaceMode;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// What to do with a private worktree copy once its task finishes.
///
/// Snapshot copies are always removed; shared tasks have nothing to clean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CleanupPolicy {
    Always,
    OnSuccess,
    /// Keep every worktree for inspection.
    #[default]
    Never,
}

/// Materializes task workspaces from a single root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    scratch: PathBuf,
    cleanup: CleanupPolicy,
}

impl WorkspaceManager {
    /// `scratch` receives private copies and must not lie inside `root`.
    pub fn new(root: impl Into<PathBuf>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scratch: scratch.into(),
            cleanup: CleanupPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_cleanup(mut self, cleanup: CleanupPolicy) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cleanup_policy(&self) -> CleanupPolicy {
        self.cleanup
    }

    /// Prepares the filesystem view for one task.
    pub fn prepare(
        &self,
        stage_id: &str,
        task_id: &str,
        mode: WorkspaceMode,
    ) -> Result<TaskWorkspace, WorkspaceError> {
        if !self.root.is_dir() {
            return Err(WorkspaceError::RootMissing(self.root.clone()));
        }

        let path = match mode {
            WorkspaceMode::Shared => self.root.clone(),
            WorkspaceMode::Worktree | WorkspaceMode::SnapshotRo => {
                let dest = self.scratch.join(stage_id).join(task_id);
                if dest.exists() {
                    remove_tree(&dest)?;
                }
                fs::create_dir_all(&dest).map_err(|e| WorkspaceError::io(&dest, e))?;
                copy_tree(&self.root, &dest, &self.scratch)?;
                if mode == WorkspaceMode::SnapshotRo {
                    set_tree_writable(&dest, false)?;
                }
                debug!(
                    stage = %stage_id,
                    task = %task_id,
                    mode = mode.as_str(),
                    path = %dest.display(),
                    "Prepared private workspace"
                );
                dest
            }
        };

        Ok(TaskWorkspace { path, mode })
    }

    /// Whether a finished task's private copy outlives the task.
    pub fn retains(&self, workspace: &TaskWorkspace, succeeded: bool) -> bool {
        match workspace.mode {
            WorkspaceMode::Shared | WorkspaceMode::SnapshotRo => false,
            WorkspaceMode::Worktree => match self.cleanup {
                CleanupPolicy::Always => false,
                CleanupPolicy::OnSuccess => !succeeded,
                CleanupPolicy::Never => true,
            },
        }
    }

    /// Releases a task workspace according to its mode and the cleanup policy.
    pub fn release(&self, workspace: &TaskWorkspace, succeeded: bool) {
        if !workspace.is_private() || self.retains(workspace, succeeded) {
            return;
        }
        if let Err(e) = workspace.remove() {
            warn!(path = %workspace.path.display(), error = %e, "Failed to remove task workspace");
        }
    }
}

/// A prepared task workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskWorkspace {
    path: PathBuf,
    mode: WorkspaceMode,
}

impl TaskWorkspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> WorkspaceMode {
        self.mode
    }

    /// Whether this is a private copy rather than the shared root.
    pub fn is_private(&self) -> bool {
        self.mode != WorkspaceMode::Shared
    }

    /// Deletes a private copy. The shared root is never touched.
    pub fn remove(&self) -> Result<(), WorkspaceError> {
        if !self.is_private() || !self.path.exists() {
            return Ok(());
        }
        if self.mode == WorkspaceMode::SnapshotRo {
            set_tree_writable(&self.path, true)?;
        }
        remove_tree(&self.path)
    }
}

fn remove_tree(path: &Path) -> Result<(), WorkspaceError> {
    // A leftover snapshot from an earlier attempt may still be read-only.
    set_tree_writable(path, true)?;
    fs::remove_dir_all(path).map_err(|e| WorkspaceError::io(path, e))
}

/// Copies `root` into `dest`, leaving out `scratch` when it lives inside `root`.
///
/// Both ends are canonicalized first so that `..` components or a relative
/// root cannot make the scratch directory look like ordinary content.
fn copy_tree(root: &Path, dest: &Path, scratch: &Path) -> Result<(), WorkspaceError> {
    let root = fs::canonicalize(root).map_err(|e| WorkspaceError::io(root, e))?;
    let scratch = fs::canonicalize(scratch).map_err(|e| WorkspaceError::io(scratch, e))?;

    let walker = WalkDir::new(&root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && e.path() == scratch));
    for entry in walker {
        let entry = entry.map_err(WorkspaceError::walk)?;
        let from = entry.path();
        let rel = from.strip_prefix(&root).unwrap_or(from);
        if rel.as_os_str().is_empty() {
            continue;
        }
        let to = dest.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&to).map_err(|e| WorkspaceError::io(&to, e))?;
        } else if entry.file_type().is_symlink() {
            copy_symlink(from, &to)?;
        } else {
            fs::copy(from, &to).map_err(|e| WorkspaceError::io(from, e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<(), WorkspaceError> {
    let target = fs::read_link(from).map_err(|e| WorkspaceError::io(from, e))?;
    std::os::unix::fs::symlink(&target, to).map_err(|e| WorkspaceError::io(to, e))
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<(), WorkspaceError> {
    fs::copy(from, to)
        .map(|_| ())
        .map_err(|e| WorkspaceError::io(from, e))
}

/// Sets or clears write permission on every file and directory in a tree.
///
/// Locking visits children before their directory so a directory stays
/// writable until its contents are done; unlocking opens directories first.
fn set_tree_writable(path: &Path, writable: bool) -> Result<(), WorkspaceError> {
    let walker = WalkDir::new(path)
        .follow_links(false)
        .contents_first(!writable);
    for entry in walker {
        let entry = entry.map_err(WorkspaceError::walk)?;
        if entry.path_is_symlink() {
            continue;
        }
        let metadata = entry.metadata().map_err(WorkspaceError::walk)?;
        set_writable(entry.path(), &metadata, writable)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_writable(path: &Path, metadata: &fs::Metadata, writable: bool) -> Result<(), WorkspaceError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode();
    let mode = if writable { mode | 0o200 } else { mode & !0o222 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| WorkspaceError::io(path, e))
}

#[cfg(not(unix))]
fn set_writable(path: &Path, metadata: &fs::Metadata, writable: bool) -> Result<(), WorkspaceError> {
    let mut permissions = metadata.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(!writable);
    fs::set_permissions(path, permissions).map_err(|e| WorkspaceError::io(path, e))
}

/// Workspace preparation errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Workspace root {0} does not exist or is not a directory")]
    RootMissing(PathBuf),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WorkspaceError {
    fn io(path: &Path, source: io::Error) -> Self {
        WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn walk(e: walkdir::Error) -> Self {
        let path = e.path().map(Path::to_path_buf).unwrap_or_default();
        WorkspaceError::Io {
            path,
            source: e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, TempDir, WorkspaceManager) {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("README.md"), "hello").unwrap();
        fs::create_dir_all(root.path().join("src/nested")).unwrap();
        fs::write(root.path().join("src/nested/lib.rs"), "fn main() {}").unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), scratch.path());
        (root, scratch, manager)
    }

    #[test]
    fn test_shared_uses_root() {
        let (root, _scratch, manager) = fixture();
        let ws = manager.prepare("s", "t", WorkspaceMode::Shared).unwrap();
        assert_eq!(ws.path(), root.path());
        assert!(!ws.is_private());

        ws.remove().unwrap();
        assert!(root.path().join("README.md").exists());
    }

    #[test]
    fn test_worktree_is_isolated_copy() {
        let (root, scratch, manager) = fixture();
        let ws = manager.prepare("s", "t", WorkspaceMode::Worktree).unwrap();

        assert!(ws.path().starts_with(scratch.path()));
        assert_eq!(
            fs::read_to_string(ws.path().join("src/nested/lib.rs")).unwrap(),
            "fn main() {}"
        );

        fs::write(ws.path().join("README.md"), "changed").unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("README.md")).unwrap(),
            "hello"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_is_read_only() {
        let (_root, _scratch, manager) = fixture();
        let ws = manager.prepare("s", "t", WorkspaceMode::SnapshotRo).unwrap();

        let file = fs::metadata(ws.path().join("README.md")).unwrap();
        assert!(file.permissions().readonly());
        let dir = fs::metadata(ws.path().join("src")).unwrap();
        assert!(dir.permissions().readonly());

        ws.remove().unwrap();
        assert!(!ws.path().exists());
    }

    #[test]
    fn test_release_follows_policy() {
        let (_root, _scratch, manager) = fixture();
        let kept = manager.prepare("s", "kept", WorkspaceMode::Worktree).unwrap();
        manager.release(&kept, true);
        assert!(kept.path().exists());

        let snapshot = manager.prepare("s", "snap", WorkspaceMode::SnapshotRo).unwrap();
        manager.release(&snapshot, true);
        assert!(!snapshot.path().exists());

        let manager = manager.with_cleanup(CleanupPolicy::OnSuccess);
        let failed = manager.prepare("s", "failed", WorkspaceMode::Worktree).unwrap();
        assert!(manager.retains(&failed, false));
        assert!(!manager.retains(&failed, true));
        manager.release(&failed, false);
        assert!(failed.path().exists());
        manager.release(&failed, true);
        assert!(!failed.path().exists());
    }

    #[test]
    fn test_prepare_replaces_stale_copy() {
        let (_root, _scratch, manager) = fixture();
        let first = manager.prepare("s", "t", WorkspaceMode::SnapshotRo).unwrap();
        let second = manager.prepare("s", "t", WorkspaceMode::Worktree).unwrap();
        assert_eq!(first.path(), second.path());
        fs::write(second.path().join("new.txt"), "ok").unwrap();
    }

    #[test]
    fn test_scratch_inside_root_is_not_copied() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.txt"), "a").unwrap();
        let scratch = root.path().join(".boxrun");
        let manager = WorkspaceManager::new(root.path(), &scratch);

        let ws = manager.prepare("s", "t", WorkspaceMode::Worktree).unwrap();
        assert!(ws.path().join("a.txt").exists());
        assert!(!ws.path().join(".boxrun").exists());
    }

    #[test]
    fn test_scratch_exclusion_survives_unnormalized_paths() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.txt"), "a").unwrap();
        fs::create_dir_all(root.path().join("src")).unwrap();
        let manager = WorkspaceManager::new(
            root.path().join("src").join(".."),
            root.path().join(".boxrun"),
        );

        let ws = manager.prepare("s", "t", WorkspaceMode::Worktree).unwrap();
        assert!(ws.path().join("a.txt").exists());
        assert!(ws.path().join("src").is_dir());
        assert!(!ws.path().join(".boxrun").exists());

        let again = manager.prepare("s", "u", WorkspaceMode::Worktree).unwrap();
        assert!(!again.path().join(".boxrun").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_copied_as_links() {
        let (root, _scratch, manager) = fixture();
        std::os::unix::fs::symlink("README.md", root.path().join("link.md")).unwrap();

        let ws = manager.prepare("s", "t", WorkspaceMode::SnapshotRo).unwrap();
        let link = ws.path().join("link.md");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("README.md"));

        ws.remove().unwrap();
        assert!(!ws.path().exists());
    }

    #[test]
    fn test_missing_root() {
        let manager = WorkspaceManager::new("/definitely/not/here", "/tmp/boxrun-scratch");
        assert!(matches!(
            manager.prepare("s", "t", WorkspaceMode::Shared),
            Err(WorkspaceError::RootMissing(_))
        ));
    }
}
