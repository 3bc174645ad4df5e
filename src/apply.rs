//! Apply Orchestrator.
//!
//! Executes a precomputed plan (desired state plus an ordered change list)
//! against the workspaces under a root. The order is fixed:
//!
//! 1. start prefetching every store any addition will need
//! 2. remove workspaces
//! 3. remove (or rename in place) the old side of repo updates
//! 4. wait for the prefetches
//! 5. create new workspaces with their members
//! 6. add the new side of repo updates
//!
//! The first failing step aborts the run. Nothing is rolled back. A store
//! that cannot be prefetched only logs a warning; the addition that needs it
//! reports the real error later.

use std::time::Duration;

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::git::{GionError, NameKind, RepoIdentity, url::resolve_location};
use crate::paths::Root;
use crate::prefetch::Prefetcher;
use crate::store;
use crate::sync::CancelToken;
use crate::workspace::worktree::{self, AddRepo};
use crate::workspace::{self, Metadata, RemoveOptions, WorkspaceMode};

/// Target state of every workspace the plan mentions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub workspaces: IndexMap<String, WorkspaceSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSpec {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mode: Option<WorkspaceMode>,
    #[serde(default)]
    pub preset_name: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub repos: Vec<RepoSpec>,
}

impl WorkspaceSpec {
    fn metadata(&self) -> Metadata {
        Metadata {
            description: self.description.clone(),
            mode: self.mode,
            preset_name: self.preset_name.clone(),
            source_url: self.source_url.clone(),
            base_branch: String::new(),
        }
    }
}

/// One member of a desired workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSpec {
    /// Repository location or `host/owner/repo` key.
    pub repo: String,
    /// Defaults to the repository name.
    #[serde(default)]
    pub alias: String,
    /// Defaults to the workspace ID.
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub base_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceChange {
    pub kind: ChangeKind,
    pub workspace_id: String,
    /// Member changes; only meaningful for updates.
    #[serde(default)]
    pub repos: Vec<RepoChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoChange {
    pub kind: ChangeKind,
    pub alias: String,
    #[serde(default)]
    pub from_repo: String,
    #[serde(default)]
    pub to_repo: String,
    #[serde(default)]
    pub from_branch: String,
    #[serde(default)]
    pub to_branch: String,
}

impl RepoChange {
    /// A repo update that keeps the repository and only changes the branch
    /// is applied as `git branch -m` instead of remove + add.
    fn renames_in_place(&self) -> bool {
        let fields = [
            &self.from_repo,
            &self.to_repo,
            &self.from_branch,
            &self.to_branch,
        ];
        if self.kind != ChangeKind::Update || fields.iter().any(|f| f.trim().is_empty()) {
            return false;
        }
        same_repo(&self.from_repo, &self.to_repo) && self.from_branch.trim() != self.to_branch.trim()
    }
}

/// Externally computed plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub desired: DesiredState,
    #[serde(default)]
    pub changes: Vec<WorkspaceChange>,
}

impl Plan {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("failed to parse plan")
    }
}

#[derive(Default, Clone, Copy)]
pub struct ApplyOptions<'a> {
    pub allow_dirty: bool,
    pub allow_status_error: bool,
    /// Bounds each background fetch individually.
    pub prefetch_timeout: Option<Duration>,
    /// Called with a short description before each action.
    pub step: Option<&'a dyn Fn(&str)>,
}

impl ApplyOptions<'_> {
    fn step(&self, text: String) {
        log::info!("{text}");
        if let Some(step) = self.step {
            step(&text);
        }
    }

    fn remove_options(&self) -> RemoveOptions {
        RemoveOptions {
            allow_dirty: self.allow_dirty,
            allow_status_error: self.allow_status_error,
        }
    }
}

pub fn apply(
    root: &Root,
    plan: &Plan,
    opts: &ApplyOptions<'_>,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let prefetcher = Prefetcher::new(opts.prefetch_timeout);
    let locations = collect_locations(plan)?;
    if let Err(e) = prefetcher.start_all(root, locations.iter().map(String::as_str), cancel) {
        log::warn!("prefetch: {e:#}");
    }

    for change in changes_of(plan, ChangeKind::Remove) {
        opts.step(format!("remove workspace {}", change.workspace_id));
        workspace::remove(root, &change.workspace_id, opts.remove_options(), cancel)?;
    }

    for change in changes_of(plan, ChangeKind::Update) {
        remove_old_members(root, change, opts, cancel)?;
        rename_members(root, change, opts, cancel)?;
    }

    prefetcher.wait_all(locations.iter().map(String::as_str), cancel)?;

    for change in &plan.changes {
        match change.kind {
            ChangeKind::Add => add_workspace(root, &plan.desired, change, opts, cancel)?,
            ChangeKind::Update => add_new_members(root, &plan.desired, change, opts, cancel)?,
            ChangeKind::Remove => {}
        }
    }

    Ok(())
}

fn changes_of(plan: &Plan, kind: ChangeKind) -> impl Iterator<Item = &WorkspaceChange> {
    plan.changes.iter().filter(move |c| c.kind == kind)
}

/// Locations of every store an addition will use, one per identity.
fn collect_locations(plan: &Plan) -> anyhow::Result<Vec<String>> {
    let mut unique: IndexMap<String, String> = IndexMap::new();
    let mut push = |repo: &str| -> anyhow::Result<()> {
        let location = resolve_location(repo)?;
        let key = RepoIdentity::parse(&location)?.key();
        unique.entry(key).or_insert(location);
        Ok(())
    };

    for change in &plan.changes {
        match change.kind {
            ChangeKind::Add => {
                if let Some(ws) = plan.desired.workspaces.get(&change.workspace_id) {
                    for repo in &ws.repos {
                        push(&repo.repo)?;
                    }
                }
            }
            ChangeKind::Update => {
                for repo in &change.repos {
                    if matches!(repo.kind, ChangeKind::Add | ChangeKind::Update) {
                        push(&repo.to_repo)?;
                    }
                }
            }
            ChangeKind::Remove => {}
        }
    }

    Ok(unique.into_values().collect())
}

fn remove_old_members(
    root: &Root,
    change: &WorkspaceChange,
    opts: &ApplyOptions<'_>,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    for repo in &change.repos {
        if !matches!(repo.kind, ChangeKind::Remove | ChangeKind::Update) || repo.renames_in_place() {
            continue;
        }
        opts.step(format!("worktree remove {}", repo.alias));
        worktree::remove_repo(
            root,
            &change.workspace_id,
            &repo.alias,
            opts.remove_options(),
            cancel,
        )?;
    }
    Ok(())
}

fn rename_members(
    root: &Root,
    change: &WorkspaceChange,
    opts: &ApplyOptions<'_>,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    for repo in change.repos.iter().filter(|r| r.renames_in_place()) {
        opts.step(format!("branch rename {}", repo.alias));
        worktree::rename_branch(
            root,
            &change.workspace_id,
            &repo.alias,
            repo.from_branch.trim(),
            repo.to_branch.trim(),
            cancel,
        )?;
    }
    Ok(())
}

fn add_workspace(
    root: &Root,
    desired: &DesiredState,
    change: &WorkspaceChange,
    opts: &ApplyOptions<'_>,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let id = &change.workspace_id;
    let spec = desired
        .workspaces
        .get(id)
        .ok_or_else(|| GionError::not_found("workspace in desired state", id.as_str()))?;

    opts.step(format!("create workspace {id}"));
    workspace::create(root, id, &spec.metadata(), cancel)?;

    let mut base_to_record = None;
    for repo in &spec.repos {
        let alias = alias_for(repo)?;
        opts.step(format!("worktree add {alias}"));
        if spec.mode == Some(WorkspaceMode::Review) {
            add_review_member(root, id, repo, &alias, cancel)?;
            continue;
        }
        let added = worktree::add(
            root,
            id,
            &AddRepo {
                location: resolve_location(&repo.repo)?,
                alias: Some(alias),
                branch: non_empty(&repo.branch),
                base_ref: non_empty(&repo.base_ref),
                fetch: false,
            },
            cancel,
        )?;
        if added.created_branch && base_to_record.is_none() {
            base_to_record = added.base_ref;
        }
    }

    record_base(root, id, base_to_record)
}

/// Review workspaces check out the remote branch under review.
fn add_review_member(
    root: &Root,
    workspace_id: &str,
    repo: &RepoSpec,
    alias: &str,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let branch = repo.branch.trim();
    if branch.is_empty() {
        return Err(GionError::InvalidName {
            kind: NameKind::Branch,
            name: String::new(),
            reason: format!("required for review member {alias}"),
        }
        .into());
    }
    let location = resolve_location(&repo.repo)?;
    let (_, exists) = store::exists(root, &location)?;
    let store = if exists {
        store::open(root, &location, false, cancel)?
    } else {
        store::get(root, &location, cancel)?
    };
    store
        .repository(root, cancel)
        .fetch_branch(branch)
        .with_context(|| format!("failed to fetch {branch} for {alias}"))?;

    worktree::add_tracking(
        root,
        workspace_id,
        &location,
        Some(alias),
        branch,
        &format!("origin/{branch}"),
        cancel,
    )?;
    Ok(())
}

fn add_new_members(
    root: &Root,
    desired: &DesiredState,
    change: &WorkspaceChange,
    opts: &ApplyOptions<'_>,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let id = &change.workspace_id;
    let mut base_to_record = None;
    for repo in &change.repos {
        if !matches!(repo.kind, ChangeKind::Add | ChangeKind::Update) || repo.renames_in_place() {
            continue;
        }
        opts.step(format!("worktree add {}", repo.alias));
        let added = worktree::add(
            root,
            id,
            &AddRepo {
                location: resolve_location(&repo.to_repo)?,
                alias: Some(repo.alias.clone()),
                branch: non_empty(&repo.to_branch),
                base_ref: desired_base_ref(desired, id, &repo.alias),
                fetch: false,
            },
            cancel,
        )?;
        if added.created_branch && base_to_record.is_none() {
            base_to_record = added.base_ref;
        }
    }

    record_base(root, id, base_to_record)
}

fn record_base(root: &Root, id: &str, base: Option<String>) -> anyhow::Result<()> {
    if let Some(base) = base
        && workspace::record_base_branch_if_missing(root, id, &base)?
    {
        log::debug!("recorded base branch {base} for {id}");
    }
    Ok(())
}

fn desired_base_ref(desired: &DesiredState, workspace_id: &str, alias: &str) -> Option<String> {
    let ws = desired.workspaces.get(workspace_id)?;
    ws.repos
        .iter()
        .find(|r| alias_for(r).is_ok_and(|a| a == alias.trim()))
        .and_then(|r| non_empty(&r.base_ref))
}

fn alias_for(repo: &RepoSpec) -> anyhow::Result<String> {
    if let Some(alias) = non_empty(&repo.alias) {
        return Ok(alias);
    }
    let identity = RepoIdentity::parse(&resolve_location(&repo.repo)?)?;
    Ok(identity.repo().to_string())
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn same_repo(a: &str, b: &str) -> bool {
    let key = |s: &str| {
        resolve_location(s)
            .and_then(|l| RepoIdentity::parse(&l))
            .map(|i| i.key())
            .unwrap_or_else(|_| s.trim().to_string())
    };
    key(a) == key(b)
}
