//! Repo Store Manager.
//!
//! Each repository identity gets exactly one bare store under `<root>/bare`.
//! Every workspace that references the repository attaches worktrees to that
//! store; nothing else ever holds its own object database.
//!
//! Opening a store always synchronizes it:
//!
//! 1. force the fetch refspec to track every remote head
//! 2. ask the remote for its default branch and hash (`ls-remote --symref`)
//! 3. point `origin/HEAD` at that branch
//! 4. fetch only when asked to, on first sync, or when the hash moved
//! 5. prune local heads other than the default branch and branches that
//!    back a worktree

use std::path::PathBuf;

use anyhow::Context;

use crate::git::{self, GionError, RepoIdentity, Repository, RunOptions};
use crate::paths::{Root, dir_exists};
use crate::sync::CancelToken;

const FETCH_REFSPEC: &str = "+refs/heads/*:refs/remotes/origin/*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoStore {
    pub identity: RepoIdentity,
    pub store_path: PathBuf,
    /// The location the store was requested with; the semantic remote.
    pub remote_url: String,
}

impl RepoStore {
    pub fn key(&self) -> String {
        self.identity.key()
    }

    pub fn repository(&self, root: &Root, cancel: &CancelToken) -> Repository {
        root.repository(&self.store_path, cancel)
    }
}

/// Store path for `location` and whether it already exists.
pub fn exists(root: &Root, location: &str) -> anyhow::Result<(PathBuf, bool)> {
    let identity = RepoIdentity::parse(location)?;
    let store_path = root.store_path(&identity);
    let exists = dir_exists(&store_path)?;
    Ok((store_path, exists))
}

/// Get the store for `location`, cloning it if this is the first reference.
///
/// Also makes sure the convenience clone under `src/` exists.
pub fn get(root: &Root, location: &str, cancel: &CancelToken) -> anyhow::Result<RepoStore> {
    let store = resolve(root, location)?;

    if !dir_exists(&store.store_path)? {
        create_parent(&store.store_path)?;
        log::info!("cloning {} into {}", store.remote_url, store.store_path.display());
        let dest = store.store_path.to_string_lossy();
        git::run_checked(
            root.git().as_ref(),
            cancel,
            None,
            &["clone", "--bare", &store.remote_url, &dest],
            RunOptions::default(),
        )
        .with_context(|| format!("failed to clone {}", store.remote_url))?;
    }

    let repo = store.repository(root, cancel);
    normalize_store(&repo, &store.key(), false)?;
    ensure_src(root, &store, false, cancel)?;

    Ok(store)
}

/// Open an existing store and synchronize it, optionally forcing a fetch.
pub fn open(
    root: &Root,
    location: &str,
    fetch: bool,
    cancel: &CancelToken,
) -> anyhow::Result<RepoStore> {
    let store = resolve(root, location)?;
    if !dir_exists(&store.store_path)? {
        return Err(GionError::not_found("repo store", store.key()).into());
    }

    let repo = store.repository(root, cancel);
    normalize_store(&repo, &store.key(), fetch)?;

    Ok(store)
}

/// Background-fetch entry point used by the prefetcher.
pub fn prefetch(root: &Root, location: &str, cancel: &CancelToken) -> anyhow::Result<RepoStore> {
    open(root, location, true, cancel)
}

/// Make sure the `src/` clone exists, fetching into it when it already does
/// and `fetch` is set.
///
/// The clone is taken from the local bare store, then its `origin` is
/// rewritten to the real remote.
pub fn ensure_src(
    root: &Root,
    store: &RepoStore,
    fetch: bool,
    cancel: &CancelToken,
) -> anyhow::Result<PathBuf> {
    let src_path = root.src_path(&store.identity);
    if dir_exists(&src_path)? {
        if fetch {
            root.repository(&src_path, cancel).fetch_prune()?;
        }
        return Ok(src_path);
    }

    create_parent(&src_path)?;
    let source = store.store_path.to_string_lossy();
    let dest = src_path.to_string_lossy();
    git::run_checked(
        root.git().as_ref(),
        cancel,
        None,
        &["clone", "--quiet", &source, &dest],
        RunOptions::default(),
    )?;

    let src = root.repository(&src_path, cancel);
    if let Err(e) = src.remote_set_url("origin", &store.remote_url) {
        log::warn!("failed to point {} at {}: {e:#}", src_path.display(), store.remote_url);
    }

    Ok(src_path)
}

/// Every store under `<root>/bare`, sorted by key.
pub fn list(root: &Root) -> anyhow::Result<Vec<RepoIdentity>> {
    let bare = root.bare_root();
    let mut identities = Vec::new();
    if !dir_exists(&bare)? {
        return Ok(identities);
    }

    for host in read_dirs(&bare)? {
        for owner in read_dirs(&host)? {
            for repo in read_dirs(&owner)? {
                let (Some(host), Some(owner), Some(repo)) = (
                    file_name(&host),
                    file_name(&owner),
                    file_name(&repo).and_then(|n| n.strip_suffix(".git").map(str::to_string)),
                ) else {
                    continue;
                };
                match RepoIdentity::from_key(&format!("{host}/{owner}/{repo}")) {
                    Ok(identity) => identities.push(identity),
                    Err(e) => log::warn!("skipping store: {e}"),
                }
            }
        }
    }

    identities.sort();
    Ok(identities)
}

/// Whether a store needs a network fetch.
///
/// An explicit request or a missing remote-tracking ref always fetches;
/// otherwise a fetch happens only when both hashes are known and differ.
pub fn needs_fetch(
    requested: bool,
    has_local_tracking: bool,
    local_hash: Option<&str>,
    remote_hash: Option<&str>,
) -> bool {
    if requested || !has_local_tracking {
        return true;
    }
    matches!((local_hash, remote_hash), (Some(local), Some(remote)) if local != remote)
}

fn resolve(root: &Root, location: &str) -> anyhow::Result<RepoStore> {
    let identity = RepoIdentity::parse(location)?;
    let store_path = root.store_path(&identity);
    Ok(RepoStore {
        identity,
        store_path,
        remote_url: location.trim().to_string(),
    })
}

fn normalize_store(repo: &Repository, display: &str, fetch: bool) -> anyhow::Result<()> {
    if repo.config_values("remote.origin.fetch")? != [FETCH_REFSPEC] {
        repo.set_config("remote.origin.fetch", FETCH_REFSPEC)?;
    }

    let remote = repo
        .ls_remote_head()
        .with_context(|| format!("failed to query default branch of {display}"))?;

    if let Some(branch) = &remote.branch {
        let target = format!("refs/remotes/origin/{branch}");
        if let Err(e) = repo.set_symbolic_ref("refs/remotes/origin/HEAD", &target) {
            log::warn!("failed to set origin/HEAD for {display}: {e:#}");
        }
    }

    let local_hash = match &remote.branch {
        Some(branch) => repo
            .show_ref(&format!("refs/remotes/origin/{branch}"))?
            .found(),
        None => None,
    };

    if needs_fetch(
        fetch,
        local_hash.is_some(),
        local_hash.as_deref(),
        remote.hash.as_deref(),
    ) {
        log::info!("fetching {display}");
        repo.fetch_prune()
            .with_context(|| format!("failed to fetch {display}"))?;
    } else {
        log::debug!("{display} is up to date");
    }

    prune_local_heads(repo, remote.branch.as_deref())
}

/// Delete local heads nobody uses.
///
/// Heads are listed before worktrees so that a branch renamed in between is
/// never seen as unused.
fn prune_local_heads(repo: &Repository, keep: Option<&str>) -> anyhow::Result<()> {
    let heads = repo.local_heads()?;
    let in_use = repo.worktree_branches()?;
    for name in heads {
        if Some(name.as_str()) == keep || in_use.contains(&name) {
            continue;
        }
        if let Err(e) = repo.delete_ref(&format!("refs/heads/{name}")) {
            log::warn!("failed to prune {name} in {}: {e:#}", repo.path().display());
        }
    }
    Ok(())
}

fn create_parent(path: &std::path::Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

fn read_dirs(dir: &std::path::Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn file_name(path: &std::path::Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}
