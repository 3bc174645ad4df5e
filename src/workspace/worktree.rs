//! Worktree Engine: attach, detach and re-branch workspace members.

use std::path::PathBuf;

use anyhow::Context;

use crate::git::{GionError, NameKind, RefLookup, RepoIdentity, Repository};
use crate::paths::{Root, path_exists};
use crate::store::{self, RepoStore};
use crate::sync::CancelToken;

use super::metadata::METADATA_DIR_NAME;
use super::{RemoveOptions, RepoEntry};

const FALLBACK_BRANCHES: [&str; 3] = ["main", "master", "develop"];

/// What to add to a workspace.
#[derive(Debug, Clone, Default)]
pub struct AddRepo {
    pub location: String,
    /// Defaults to the repository name.
    pub alias: Option<String>,
    /// Defaults to the workspace ID.
    pub branch: Option<String>,
    /// Start point for a new branch; resolved from the store when absent.
    pub base_ref: Option<String>,
    /// Force a fetch while synchronizing an existing store.
    pub fetch: bool,
}

impl AddRepo {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedRepo {
    pub entry: RepoEntry,
    /// Whether the branch was created rather than attached.
    pub created_branch: bool,
    /// The start point of a created branch.
    pub base_ref: Option<String>,
}

/// Everything checked before a worktree is created.
struct Target {
    identity: RepoIdentity,
    alias: String,
    worktree_path: PathBuf,
}

/// Add a worktree for `req.location` to a workspace.
///
/// An existing local branch is attached as-is; otherwise a new branch is cut
/// from `req.base_ref` or the store's resolved default.
pub fn add(
    root: &Root,
    workspace_id: &str,
    req: &AddRepo,
    cancel: &CancelToken,
) -> anyhow::Result<AddedRepo> {
    let branch = req.branch.as_deref().unwrap_or(workspace_id);
    super::validate_branch_name(root, branch, cancel)?;
    let target = prepare(root, workspace_id, &req.location, req.alias.as_deref(), cancel)?;

    let store = open_or_get(root, &req.location, req.fetch, cancel)?;
    let repo = store.repository(root, cancel);

    let (created_branch, base_ref) = if repo.local_branch_exists(branch)? {
        log::info!("worktree add {} ({branch})", target.alias);
        repo.worktree_add_existing(&target.worktree_path, branch)?;
        (false, None)
    } else {
        let base = match &req.base_ref {
            Some(base) => base.clone(),
            None => resolve_base_ref(&repo)?,
        };
        log::info!("worktree add {} ({branch} from {base})", target.alias);
        repo.worktree_add_new_branch(branch, &target.worktree_path, &base)?;
        (true, Some(base))
    };

    Ok(AddedRepo {
        entry: entry_for(&target, &store, &req.location, branch),
        created_branch,
        base_ref,
    })
}

/// Add a worktree on a new branch that tracks an existing remote-tracking
/// ref (`origin/<branch>` or `refs/remotes/...`).
pub fn add_tracking(
    root: &Root,
    workspace_id: &str,
    location: &str,
    alias: Option<&str>,
    branch: &str,
    remote_ref: &str,
    cancel: &CancelToken,
) -> anyhow::Result<AddedRepo> {
    super::validate_branch_name(root, branch, cancel)?;
    let full_ref = if remote_ref.starts_with("refs/remotes/") {
        remote_ref.to_string()
    } else if remote_ref.starts_with("origin/") {
        format!("refs/remotes/{remote_ref}")
    } else {
        return Err(GionError::invalid_name(
            NameKind::Branch,
            remote_ref,
            "remote ref must start with origin/ or refs/remotes/",
        )
        .into());
    };
    let target = prepare(root, workspace_id, location, alias, cancel)?;

    let store = open_or_get(root, location, false, cancel)?;
    let repo = store.repository(root, cancel);
    if !repo.ref_exists(&full_ref)? {
        return Err(GionError::not_found("ref", remote_ref).into());
    }

    log::info!("worktree add {} ({branch} tracking {remote_ref})", target.alias);
    repo.worktree_add_tracking(branch, &target.worktree_path, remote_ref)?;

    Ok(AddedRepo {
        entry: entry_for(&target, &store, location, branch),
        created_branch: true,
        base_ref: Some(remote_ref.to_string()),
    })
}

/// Detach one alias from a workspace, gated on its status.
pub fn remove_repo(
    root: &Root,
    workspace_id: &str,
    alias: &str,
    opts: RemoveOptions,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let entry = find_entry(root, workspace_id, alias, cancel)?;
    super::state::check_removable(root, &entry, opts, cancel)?;

    let Some(store_path) = &entry.store_path else {
        return Err(GionError::not_found("repo store", format!("{workspace_id}/{alias}")).into());
    };
    log::info!("worktree remove {alias}");
    root.repository(store_path, cancel)
        .worktree_remove(&entry.worktree_path, opts.allow_dirty)
        .with_context(|| format!("failed to remove worktree {alias}"))
}

/// Rename the branch checked out by `alias` from `from` to `to`.
pub fn rename_branch(
    root: &Root,
    workspace_id: &str,
    alias: &str,
    from: &str,
    to: &str,
    cancel: &CancelToken,
) -> anyhow::Result<RepoEntry> {
    super::validate_branch_name(root, to, cancel)?;
    let mut entry = find_entry(root, workspace_id, alias, cancel)?;
    if entry.branch != from {
        return Err(GionError::InvalidName {
            kind: NameKind::Branch,
            name: from.to_string(),
            reason: format!("{alias} is on {:?}", entry.branch),
        }
        .into());
    }

    log::info!("branch rename {alias} ({from} -> {to})");
    root.repository(&entry.worktree_path, cancel)
        .rename_branch(from, to)?;
    entry.branch = to.to_string();
    Ok(entry)
}

/// Pick the start point for a new branch in `repo` (a bare store).
///
/// Tried in order, first hit wins:
/// 1. `origin/HEAD`'s target, as `origin/<branch>`
/// 2. the store's own `HEAD` target
/// 3. local `main`, `master`, `develop`
/// 4. `origin/main`, `origin/master`, `origin/develop`
pub fn resolve_base_ref(repo: &Repository) -> anyhow::Result<String> {
    let mut lookup_error: Option<anyhow::Error> = None;
    let mut record = |err: anyhow::Error| -> anyhow::Result<()> {
        if matches!(
            err.downcast_ref::<GionError>(),
            Some(GionError::Cancelled | GionError::TimedOut { .. })
        ) {
            return Err(err);
        }
        log::debug!("base ref lookup failed: {err:#}");
        lookup_error.get_or_insert(err);
        Ok(())
    };

    match repo.symbolic_ref("refs/remotes/origin/HEAD") {
        Ok(RefLookup::Found(target)) => {
            if let Some(remote_ref) = target.strip_prefix("refs/remotes/") {
                return Ok(remote_ref.to_string());
            }
        }
        Ok(RefLookup::Absent) => {}
        Err(e) => record(e)?,
    }

    match repo.symbolic_ref("HEAD") {
        Ok(RefLookup::Found(target)) => match repo.ref_exists(&target) {
            Ok(true) => return Ok(target),
            Ok(false) => {}
            Err(e) => record(e)?,
        },
        Ok(RefLookup::Absent) => {}
        Err(e) => record(e)?,
    }

    for candidate in FALLBACK_BRANCHES {
        let reference = format!("refs/heads/{candidate}");
        match repo.ref_exists(&reference) {
            Ok(true) => return Ok(reference),
            Ok(false) => {}
            Err(e) => record(e)?,
        }
    }

    for candidate in FALLBACK_BRANCHES {
        match repo.ref_exists(&format!("refs/remotes/origin/{candidate}")) {
            Ok(true) => return Ok(format!("origin/{candidate}")),
            Ok(false) => {}
            Err(e) => record(e)?,
        }
    }

    let not_found = GionError::BaseRefNotFound {
        store: repo.path().display().to_string(),
    };
    Err(match lookup_error {
        Some(err) => err.context(not_found),
        None => not_found.into(),
    })
}

fn validate_alias(alias: &str) -> Result<(), GionError> {
    let invalid = |reason: &str| GionError::invalid_name(NameKind::Alias, alias, reason);
    if alias.trim().is_empty() {
        return Err(invalid("alias is required"));
    }
    if alias.contains(['/', '\\']) {
        return Err(invalid("must not contain path separators"));
    }
    if alias == "." || alias == ".." || alias == METADATA_DIR_NAME {
        return Err(invalid("reserved name"));
    }
    Ok(())
}

/// Validate the workspace, identity and alias, and check uniqueness, before
/// anything is mutated.
fn prepare(
    root: &Root,
    workspace_id: &str,
    location: &str,
    alias: Option<&str>,
    cancel: &CancelToken,
) -> anyhow::Result<Target> {
    super::validate_workspace_id(root, workspace_id, cancel)?;
    let ws_dir = super::require(root, workspace_id)?;

    let identity = RepoIdentity::parse(location)?;
    let alias = alias.unwrap_or(identity.repo()).to_string();
    validate_alias(&alias)?;

    let (existing, _) = super::scan_repos(root, &ws_dir, cancel)?;
    let key = identity.key();
    for repo in &existing {
        if repo.alias == alias {
            return Err(GionError::already_exists("alias", alias).into());
        }
        if repo.repo_key == key {
            return Err(GionError::already_exists("repo", key).into());
        }
    }

    let worktree_path = ws_dir.join(&alias);
    if path_exists(&worktree_path)? {
        return Err(GionError::already_exists("worktree", worktree_path.display().to_string()).into());
    }

    Ok(Target {
        identity,
        alias,
        worktree_path,
    })
}

fn open_or_get(
    root: &Root,
    location: &str,
    fetch: bool,
    cancel: &CancelToken,
) -> anyhow::Result<RepoStore> {
    let (_, exists) = store::exists(root, location)?;
    if exists {
        store::open(root, location, fetch, cancel)
    } else {
        store::get(root, location, cancel)
    }
}

fn find_entry(
    root: &Root,
    workspace_id: &str,
    alias: &str,
    cancel: &CancelToken,
) -> anyhow::Result<RepoEntry> {
    let ws_dir = super::require(root, workspace_id)?;
    let (repos, _) = super::scan_repos(root, &ws_dir, cancel)?;
    repos
        .into_iter()
        .find(|r| r.alias == alias)
        .ok_or_else(|| GionError::not_found("alias", format!("{workspace_id}/{alias}")).into())
}

fn entry_for(target: &Target, store: &RepoStore, location: &str, branch: &str) -> RepoEntry {
    debug_assert_eq!(target.identity, store.identity);
    RepoEntry {
        alias: target.alias.clone(),
        repo_url: location.trim().to_string(),
        repo_key: target.identity.key(),
        store_path: Some(store.store_path.clone()),
        worktree_path: target.worktree_path.clone(),
        branch: branch.to_string(),
    }
}
