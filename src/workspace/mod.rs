//! Workspace Store.
//!
//! A workspace is a directory under `<root>/workspaces/<id>` holding one
//! worktree per alias plus an optional metadata sidecar. Membership is never
//! recorded separately: it is discovered by scanning the directory, so the
//! filesystem and git stay the single source of truth.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::git::{self, GionError, NameKind, RepoIdentity};
use crate::paths::{Root, dir_exists};
use crate::sync::CancelToken;

pub mod metadata;
pub mod state;
pub mod worktree;

pub use metadata::{Metadata, WorkspaceMode};

/// One alias's worktree inside a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoEntry {
    pub alias: String,
    /// `origin` URL of the worktree.
    pub repo_url: String,
    /// Identity key derived from `repo_url`; empty if it could not be parsed.
    pub repo_key: String,
    /// Bare store the worktree is linked to. `None` for a standalone clone.
    pub store_path: Option<PathBuf>,
    pub worktree_path: PathBuf,
    /// Checked-out branch; empty on a detached HEAD.
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceEntry {
    pub id: String,
    pub path: PathBuf,
    pub description: String,
}

/// Knobs for status-gated removal.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Discard uncommitted changes (forces `worktree remove`).
    pub allow_dirty: bool,
    /// Proceed when status cannot be collected.
    pub allow_status_error: bool,
}

/// Reject workspace IDs that are not usable both as a directory name and as
/// a branch name.
pub fn validate_workspace_id(
    root: &Root,
    id: &str,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let invalid = |reason: &str| GionError::invalid_name(NameKind::WorkspaceId, id, reason);
    if id.is_empty() {
        return Err(invalid("workspace id is required").into());
    }
    if id.contains(['/', '\\']) {
        return Err(invalid("must not contain path separators").into());
    }
    if id == "." || id == ".." {
        return Err(invalid("must not be a path traversal").into());
    }
    if !git::check_ref_format_branch(root.git().as_ref(), cancel, id)? {
        return Err(invalid("not a valid git branch name").into());
    }
    Ok(())
}

pub fn validate_branch_name(
    root: &Root,
    branch: &str,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    if branch.trim().is_empty() {
        return Err(GionError::invalid_name(NameKind::Branch, branch, "branch is required").into());
    }
    if !git::check_ref_format_branch(root.git().as_ref(), cancel, branch)? {
        return Err(
            GionError::invalid_name(NameKind::Branch, branch, "not a valid git branch name").into(),
        );
    }
    Ok(())
}

/// Workspace directory, failing with NotFound when it does not exist.
pub fn require(root: &Root, id: &str) -> anyhow::Result<PathBuf> {
    let ws_dir = root.workspace_dir(id);
    if !dir_exists(&ws_dir)? {
        return Err(GionError::not_found("workspace", id).into());
    }
    Ok(ws_dir)
}

/// Create an empty workspace directory.
pub fn new(root: &Root, id: &str, cancel: &CancelToken) -> anyhow::Result<PathBuf> {
    validate_workspace_id(root, id, cancel)?;

    let ws_dir = root.workspace_dir(id);
    if dir_exists(&ws_dir)? {
        return Err(GionError::already_exists("workspace", id).into());
    }
    std::fs::create_dir_all(&ws_dir)
        .with_context(|| format!("failed to create {}", ws_dir.display()))?;
    log::info!("created workspace {id}");
    Ok(ws_dir)
}

/// Create a workspace and write its metadata.
pub fn create(
    root: &Root,
    id: &str,
    meta: &Metadata,
    cancel: &CancelToken,
) -> anyhow::Result<PathBuf> {
    // Validate before anything touches the disk.
    meta.validate()?;
    let ws_dir = new(root, id, cancel)?;
    metadata::save(&ws_dir, meta)?;
    Ok(ws_dir)
}

/// All workspaces, sorted by ID. Unreadable metadata becomes a warning.
pub fn list(root: &Root) -> anyhow::Result<(Vec<WorkspaceEntry>, Vec<String>)> {
    let ws_root = root.workspaces_root();
    let mut entries = Vec::new();
    let mut warnings = Vec::new();
    if !dir_exists(&ws_root)? {
        return Ok((entries, warnings));
    }

    for entry in std::fs::read_dir(&ws_root)
        .with_context(|| format!("failed to read {}", ws_root.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let id = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        let description = match metadata::load(&path) {
            Ok(meta) => meta.description.trim().to_string(),
            Err(e) => {
                warnings.push(format!("workspace {id} metadata: {e:#}"));
                String::new()
            }
        };
        entries.push(WorkspaceEntry {
            id,
            path,
            description,
        });
    }

    entries.sort_by(|a, b| a.id.cmp(&b.id));
    Ok((entries, warnings))
}

/// Discover the members of a workspace directory.
///
/// Every subdirectory except the metadata directory is inspected; ones that
/// are not git checkouts are skipped with a warning.
pub fn scan_repos(
    root: &Root,
    ws_dir: &Path,
    cancel: &CancelToken,
) -> anyhow::Result<(Vec<RepoEntry>, Vec<String>)> {
    let mut repos = Vec::new();
    let mut warnings = Vec::new();

    let mut dirs = Vec::new();
    for entry in
        std::fs::read_dir(ws_dir).with_context(|| format!("failed to read {}", ws_dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() && entry.file_name() != metadata::METADATA_DIR_NAME {
            dirs.push(entry);
        }
    }
    dirs.sort_by_key(|e| e.file_name());

    for entry in dirs {
        let alias = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        match inspect_repo(root, &path, &alias, cancel) {
            Ok((repo, warning)) => {
                warnings.extend(warning);
                repos.push(repo);
            }
            Err(e) => {
                if let Some(GionError::Cancelled) = e.downcast_ref::<GionError>() {
                    return Err(e);
                }
                warnings.push(format!("skip {}: {e:#}", path.display()));
            }
        }
    }

    Ok((repos, warnings))
}

fn inspect_repo(
    root: &Root,
    path: &Path,
    alias: &str,
    cancel: &CancelToken,
) -> anyhow::Result<(RepoEntry, Option<String>)> {
    let repo = root.repository(path, cancel);
    let git_dir = repo.git_dir().context("not a git repository")?;
    let common_dir = repo.git_common_dir()?;

    let git_dir = dunce::canonicalize(&git_dir).unwrap_or(git_dir);
    let common_dir = dunce::canonicalize(&common_dir).unwrap_or(common_dir);
    let store_path = (git_dir != common_dir).then_some(common_dir);

    let branch = repo
        .symbolic_ref("HEAD")
        .ok()
        .and_then(|r| r.found())
        .map(|r| r.strip_prefix("refs/heads/").unwrap_or(&r).to_string())
        .unwrap_or_default();

    let (repo_url, repo_key, warning) = match repo.remote_get_url("origin") {
        Ok(url) if url.is_empty() => (url, String::new(), Some(format!("{alias}: origin remote is empty"))),
        Ok(url) => match RepoIdentity::parse(&url) {
            Ok(identity) => (url, identity.key(), None),
            Err(e) => (url, String::new(), Some(format!("{alias}: origin remote invalid: {e}"))),
        },
        Err(e) => (
            String::new(),
            String::new(),
            Some(format!("{alias}: origin remote missing: {e:#}")),
        ),
    };

    Ok((
        RepoEntry {
            alias: alias.to_string(),
            repo_url,
            repo_key,
            store_path,
            worktree_path: path.to_path_buf(),
            branch,
        },
        warning,
    ))
}

/// Remove a whole workspace.
///
/// Every member is status-checked before anything is deleted; a dirty member
/// or a failed status check aborts unless the matching override is set.
pub fn remove(
    root: &Root,
    id: &str,
    opts: RemoveOptions,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    validate_workspace_id(root, id, cancel)?;
    let ws_dir = require(root, id)?;

    let (repos, warnings) = scan_repos(root, &ws_dir, cancel)?;
    for warning in warnings {
        log::warn!("{warning}");
    }

    for repo in &repos {
        state::check_removable(root, repo, opts, cancel)?;
    }

    for repo in &repos {
        let Some(store_path) = &repo.store_path else {
            continue;
        };
        log::info!("removing worktree {}", repo.alias);
        root.repository(store_path, cancel)
            .worktree_remove(&repo.worktree_path, opts.allow_dirty)
            .with_context(|| format!("failed to remove worktree {}", repo.alias))?;
    }

    std::fs::remove_dir_all(&ws_dir)
        .with_context(|| format!("failed to remove {}", ws_dir.display()))?;
    log::info!("removed workspace {id}");
    Ok(())
}

/// Record `base` (an `origin/<branch>` ref) as the workspace's base branch
/// unless one is already recorded. Returns whether anything was written.
pub fn record_base_branch_if_missing(root: &Root, id: &str, base: &str) -> anyhow::Result<bool> {
    let base = base.trim();
    match base.strip_prefix("origin/") {
        Some(branch) if !branch.is_empty() => {}
        _ => return Ok(false),
    }

    let ws_dir = require(root, id)?;
    let mut meta = metadata::load(&ws_dir)?;
    if !meta.base_branch.trim().is_empty() {
        return Ok(false);
    }
    meta.base_branch = base.to_string();
    metadata::save(&ws_dir, &meta)?;
    Ok(true)
}
