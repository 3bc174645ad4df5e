//! On-disk layout under the gion root directory.
//!
//! ```text
//! <root>/
//!   bare/<host>/<owner>/<repo>.git   shared bare stores
//!   src/<host>/<owner>/<repo>        convenience clones
//!   workspaces/<id>/<alias>          worktrees
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::git::{GitRunner, RepoIdentity, Repository, SystemGit};
use crate::sync::CancelToken;

/// The root directory plus the git runner every operation under it uses.
#[derive(Clone)]
pub struct Root {
    dir: PathBuf,
    git: Arc<dyn GitRunner>,
}

impl std::fmt::Debug for Root {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Root").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl Root {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_git(dir, Arc::new(SystemGit))
    }

    pub fn with_git(dir: impl Into<PathBuf>, git: Arc<dyn GitRunner>) -> Self {
        Self {
            dir: dir.into(),
            git,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn git(&self) -> &Arc<dyn GitRunner> {
        &self.git
    }

    pub fn bare_root(&self) -> PathBuf {
        self.dir.join("bare")
    }

    pub fn src_root(&self) -> PathBuf {
        self.dir.join("src")
    }

    pub fn workspaces_root(&self) -> PathBuf {
        self.dir.join("workspaces")
    }

    pub fn store_path(&self, identity: &RepoIdentity) -> PathBuf {
        self.bare_root()
            .join(identity.host())
            .join(identity.owner())
            .join(format!("{}.git", identity.repo()))
    }

    pub fn src_path(&self, identity: &RepoIdentity) -> PathBuf {
        self.src_root()
            .join(identity.host())
            .join(identity.owner())
            .join(identity.repo())
    }

    pub fn workspace_dir(&self, workspace_id: &str) -> PathBuf {
        self.workspaces_root().join(workspace_id)
    }

    pub fn worktree_path(&self, workspace_id: &str, alias: &str) -> PathBuf {
        self.workspace_dir(workspace_id).join(alias)
    }

    /// Repository context at `path` using this root's runner.
    pub fn repository(&self, path: impl Into<PathBuf>, cancel: &CancelToken) -> Repository {
        Repository::at(path, Arc::clone(&self.git), cancel.clone())
    }
}

/// Whether `path` is an existing directory. Fails if it exists but is
/// something else.
pub fn dir_exists(path: &Path) -> anyhow::Result<bool> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(true),
        Ok(_) => anyhow::bail!("path exists but is not a directory: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("failed to stat {}", path.display())),
    }
}

/// Whether anything exists at `path` (following symlinks or not).
pub fn path_exists(path: &Path) -> anyhow::Result<bool> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("failed to stat {}", path.display())),
    }
}
