//! Status/State Engine.
//!
//! Collects live `git status` for each member of a workspace and classifies
//! it. Classification of a single repo, first match wins:
//!
//! | condition                 | state    |
//! |---------------------------|----------|
//! | status failed             | unknown  |
//! | dirty                     | dirty    |
//! | no upstream               | diverged |
//! | ahead and behind          | diverged |
//! | ahead only                | unpushed |
//! | behind only               | diverged |
//! | otherwise                 | clean    |
//!
//! A workspace takes the worst member state in the order
//! dirty > unknown > diverged > unpushed > clean.

use std::path::PathBuf;

use crate::git::{GionError, StatusSummary};
use crate::paths::Root;
use crate::sync::CancelToken;

use super::{RemoveOptions, RepoEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum RepoStateKind {
    Clean,
    Dirty,
    Unpushed,
    Diverged,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum WorkspaceStateKind {
    Clean,
    Dirty,
    Unpushed,
    Diverged,
    Unknown,
}

/// Live status of one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoStatus {
    pub alias: String,
    pub worktree_path: PathBuf,
    pub summary: StatusSummary,
    /// Why status could not be collected.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoState {
    pub status: RepoStatus,
    pub kind: RepoStateKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceState {
    pub workspace_id: String,
    pub kind: WorkspaceStateKind,
    pub repos: Vec<RepoState>,
    pub warnings: Vec<String>,
}

/// Collect status for one member. Failures are captured in
/// [`RepoStatus::error`] rather than returned.
pub fn repo_status(root: &Root, entry: &RepoEntry, cancel: &CancelToken) -> RepoStatus {
    let repo = root.repository(&entry.worktree_path, cancel);
    let (summary, error) = match repo.status_porcelain() {
        Ok(output) => (StatusSummary::parse(&output, &entry.branch), None),
        Err(e) => (
            StatusSummary {
                branch: entry.branch.clone(),
                ..Default::default()
            },
            Some(format!("{e:#}")),
        ),
    };
    RepoStatus {
        alias: entry.alias.clone(),
        worktree_path: entry.worktree_path.clone(),
        summary,
        error,
    }
}

/// Status of every member of a workspace, plus scan warnings.
pub fn status(
    root: &Root,
    workspace_id: &str,
    cancel: &CancelToken,
) -> anyhow::Result<(Vec<RepoStatus>, Vec<String>)> {
    let ws_dir = super::require(root, workspace_id)?;
    let (repos, warnings) = super::scan_repos(root, &ws_dir, cancel)?;
    let statuses = repos
        .iter()
        .map(|entry| repo_status(root, entry, cancel))
        .collect();
    Ok((statuses, warnings))
}

pub fn state(
    root: &Root,
    workspace_id: &str,
    cancel: &CancelToken,
) -> anyhow::Result<WorkspaceState> {
    let (statuses, warnings) = status(root, workspace_id, cancel)?;
    let repos: Vec<RepoState> = statuses
        .into_iter()
        .map(|status| RepoState {
            kind: classify_repo(&status),
            status,
        })
        .collect();
    Ok(WorkspaceState {
        workspace_id: workspace_id.to_string(),
        kind: aggregate(repos.iter().map(|r| r.kind)),
        repos,
        warnings,
    })
}

pub fn classify_repo(status: &RepoStatus) -> RepoStateKind {
    let s = &status.summary;
    if status.error.is_some() {
        RepoStateKind::Unknown
    } else if s.dirty {
        RepoStateKind::Dirty
    } else if !s.has_upstream() {
        RepoStateKind::Diverged
    } else if s.ahead > 0 && s.behind > 0 {
        RepoStateKind::Diverged
    } else if s.ahead > 0 {
        RepoStateKind::Unpushed
    } else if s.behind > 0 {
        RepoStateKind::Diverged
    } else {
        RepoStateKind::Clean
    }
}

pub fn aggregate(kinds: impl IntoIterator<Item = RepoStateKind>) -> WorkspaceStateKind {
    let (mut dirty, mut unknown, mut diverged, mut unpushed) = (false, false, false, false);
    for kind in kinds {
        match kind {
            RepoStateKind::Dirty => dirty = true,
            RepoStateKind::Unknown => unknown = true,
            RepoStateKind::Diverged => diverged = true,
            RepoStateKind::Unpushed => unpushed = true,
            RepoStateKind::Clean => {}
        }
    }
    if dirty {
        WorkspaceStateKind::Dirty
    } else if unknown {
        WorkspaceStateKind::Unknown
    } else if diverged {
        WorkspaceStateKind::Diverged
    } else if unpushed {
        WorkspaceStateKind::Unpushed
    } else {
        WorkspaceStateKind::Clean
    }
}

/// Whether removing a workspace in this state risks losing history.
///
/// False for dirty: uncommitted changes are gated by the allow-dirty flag at
/// removal time instead.
pub fn requires_confirmation(kind: WorkspaceStateKind) -> bool {
    matches!(
        kind,
        WorkspaceStateKind::Unpushed | WorkspaceStateKind::Diverged | WorkspaceStateKind::Unknown
    )
}

/// Status gate shared by workspace and single-alias removal.
pub(crate) fn check_removable(
    root: &Root,
    entry: &RepoEntry,
    opts: RemoveOptions,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let status = repo_status(root, entry, cancel);
    if let Some(message) = status.error {
        if opts.allow_status_error {
            log::warn!("removing {} without status: {message}", entry.alias);
            return Ok(());
        }
        return Err(GionError::StatusError {
            alias: entry.alias.clone(),
            message,
        }
        .into());
    }
    if status.summary.dirty && !opts.allow_dirty {
        return Err(GionError::DirtyWorkingTree {
            alias: entry.alias.clone(),
        }
        .into());
    }
    Ok(())
}
