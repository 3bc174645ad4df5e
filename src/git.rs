//! Git execution primitive and repository queries.
//!
//! Every git process goes through a [`GitRunner`]. Production code uses
//! [`SystemGit`]; tests wrap it to count or fail specific invocations.
//! [`Repository`] binds a runner, a directory and a cancel token together and
//! exposes the handful of typed queries the store and worktree engines need.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::shell_exec::Cmd;
use crate::sync::CancelToken;

mod error;
pub mod status;
pub mod url;

pub use error::{GionError, NameKind, exit_code};
pub use status::StatusSummary;
pub use url::RepoIdentity;

/// Subcommands gion is permitted to run.
const ALLOWED_SUBCOMMANDS: &[&str] = &[
    "branch",
    "check-ref-format",
    "clone",
    "config",
    "fetch",
    "init",
    "ls-remote",
    "remote",
    "rev-parse",
    "show-ref",
    "status",
    "symbolic-ref",
    "update-ref",
    "version",
    "worktree",
];

/// Captured result of one git invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Echo stdout/stderr through the log at info level.
    pub show_output: bool,
    /// Kill the invocation after this long.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn show_output() -> Self {
        Self {
            show_output: true,
            timeout: None,
        }
    }
}

/// Runs git.
///
/// A non-zero exit is reported through [`GitOutput::exit_code`], not as an
/// `Err`; errors are reserved for spawn failures, disallowed subcommands,
/// cancellation and timeouts.
pub trait GitRunner: Send + Sync {
    fn run(
        &self,
        cancel: &CancelToken,
        dir: Option<&Path>,
        args: &[&str],
        opts: RunOptions,
    ) -> anyhow::Result<GitOutput>;
}

/// The `git` binary on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemGit;

impl GitRunner for SystemGit {
    fn run(
        &self,
        cancel: &CancelToken,
        dir: Option<&Path>,
        args: &[&str],
        opts: RunOptions,
    ) -> anyhow::Result<GitOutput> {
        validate_args(args)?;

        let mut cmd = Cmd::new("git")
            .args(args.iter().copied())
            .cancel(cancel.clone());
        if let Some(dir) = dir {
            cmd = cmd.current_dir(dir).context(dir.display().to_string());
        }
        if let Some(timeout) = opts.timeout {
            cmd = cmd.timeout(timeout);
        }

        let output = cmd.run()?;
        let result = GitOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        if opts.show_output {
            for line in result.stdout.lines().chain(result.stderr.lines()) {
                if !line.trim().is_empty() {
                    log::info!("  {line}");
                }
            }
        }

        Ok(result)
    }
}

fn validate_args(args: &[&str]) -> anyhow::Result<()> {
    let Some(subcommand) = args.first() else {
        anyhow::bail!("git command is required");
    };
    if !ALLOWED_SUBCOMMANDS.contains(subcommand) {
        anyhow::bail!("git subcommand {subcommand:?} is not allowed");
    }
    Ok(())
}

fn command_line(args: &[&str]) -> String {
    std::iter::once("git")
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Turn a non-zero exit into [`GionError::GitFailed`].
fn check(args: &[&str], output: GitOutput) -> anyhow::Result<GitOutput> {
    if output.success() {
        return Ok(output);
    }
    Err(GionError::GitFailed {
        command: command_line(args),
        code: output.exit_code,
        stderr: output.stderr,
    }
    .into())
}

/// Run a git command that isn't tied to a repository directory.
pub fn run_checked(
    git: &dyn GitRunner,
    cancel: &CancelToken,
    dir: Option<&Path>,
    args: &[&str],
    opts: RunOptions,
) -> anyhow::Result<GitOutput> {
    let output = git.run(cancel, dir, args, opts)?;
    check(args, output)
}

/// Whether `git check-ref-format --branch` accepts `name`.
pub fn check_ref_format_branch(
    git: &dyn GitRunner,
    cancel: &CancelToken,
    name: &str,
) -> anyhow::Result<bool> {
    let output = git.run(
        cancel,
        None,
        &["check-ref-format", "--branch", name],
        RunOptions::default(),
    )?;
    Ok(output.success())
}

/// Outcome of a ref query that distinguishes "absent" from "lookup failed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefLookup {
    Found(String),
    Absent,
}

impl RefLookup {
    pub fn found(self) -> Option<String> {
        match self {
            RefLookup::Found(value) => Some(value),
            RefLookup::Absent => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, RefLookup::Found(_))
    }
}

/// The remote's default branch as reported by `ls-remote --symref origin HEAD`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteHead {
    pub branch: Option<String>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Worktree {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
    pub bare: bool,
    pub detached: bool,
    pub locked: Option<String>,
    pub prunable: Option<String>,
}

/// Repository context for git operations.
///
/// Wraps a directory (bare store, src clone or worktree), the runner used to
/// execute git in it, and the cancel token every invocation honours.
#[derive(Clone)]
pub struct Repository {
    path: PathBuf,
    git: Arc<dyn GitRunner>,
    cancel: CancelToken,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Create a repository context at the specified path.
    pub fn at(path: impl Into<PathBuf>, git: Arc<dyn GitRunner>, cancel: CancelToken) -> Self {
        Self {
            path: path.into(),
            git,
            cancel,
        }
    }

    /// Get the path this repository context operates on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run git in this repository without interpreting the exit code.
    pub fn run(&self, args: &[&str], opts: RunOptions) -> anyhow::Result<GitOutput> {
        self.git.run(&self.cancel, Some(&self.path), args, opts)
    }

    /// Run git and fail with [`GionError::GitFailed`] on a non-zero exit.
    pub fn run_checked(&self, args: &[&str], opts: RunOptions) -> anyhow::Result<GitOutput> {
        let output = self.run(args, opts)?;
        check(args, output)
    }

    /// Run git and return stdout, failing on a non-zero exit.
    pub fn run_command(&self, args: &[&str]) -> anyhow::Result<String> {
        Ok(self.run_checked(args, RunOptions::default())?.stdout)
    }

    /// Look up a fully qualified ref, returning its hash.
    ///
    /// Exit 1, or exit 128 with "not a valid ref", means the ref is absent.
    pub fn show_ref(&self, reference: &str) -> anyhow::Result<RefLookup> {
        let args = ["show-ref", "--verify", reference];
        let output = self.run(&args, RunOptions::default())?;
        if output.success() {
            let hash = output
                .stdout
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string();
            return Ok(RefLookup::Found(hash));
        }
        if ref_absent(&output) {
            return Ok(RefLookup::Absent);
        }
        check(&args, output).map(|_| RefLookup::Absent)
    }

    pub fn ref_exists(&self, reference: &str) -> anyhow::Result<bool> {
        Ok(self.show_ref(reference)?.is_found())
    }

    pub fn local_branch_exists(&self, branch: &str) -> anyhow::Result<bool> {
        self.ref_exists(&format!("refs/heads/{branch}"))
    }

    /// Read the target of a symbolic ref.
    pub fn symbolic_ref(&self, name: &str) -> anyhow::Result<RefLookup> {
        let args = ["symbolic-ref", "--quiet", name];
        let output = self.run(&args, RunOptions::default())?;
        if output.success() {
            let target = output.stdout.trim();
            return Ok(if target.is_empty() {
                RefLookup::Absent
            } else {
                RefLookup::Found(target.to_string())
            });
        }
        if output.exit_code == 1 {
            return Ok(RefLookup::Absent);
        }
        check(&args, output).map(|_| RefLookup::Absent)
    }

    pub fn set_symbolic_ref(&self, name: &str, target: &str) -> anyhow::Result<()> {
        self.run_checked(&["symbolic-ref", name, target], RunOptions::default())?;
        Ok(())
    }

    /// Every value of a config key, or empty when unset.
    pub fn config_values(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let output = self.run(&["config", "--get-all", key], RunOptions::default())?;
        if output.exit_code == 1 {
            return Ok(Vec::new());
        }
        let output = check(&["config", "--get-all", key], output)?;
        Ok(output.stdout.lines().map(str::to_string).collect())
    }

    /// Set `key` to exactly one value.
    pub fn set_config(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.run_checked(&["config", "--replace-all", key, value], RunOptions::default())?;
        Ok(())
    }

    /// Default branch and its hash on `origin`.
    pub fn ls_remote_head(&self) -> anyhow::Result<RemoteHead> {
        let stdout = self.run_command(&["ls-remote", "--symref", "origin", "HEAD"])?;
        Ok(parse_ls_remote_head(&stdout))
    }

    pub fn fetch_prune(&self) -> anyhow::Result<()> {
        self.run_checked(&["fetch", "--prune"], RunOptions::default())?;
        Ok(())
    }

    /// Fetch a single branch from `origin`, updating its remote-tracking ref.
    pub fn fetch_branch(&self, branch: &str) -> anyhow::Result<()> {
        self.run_checked(&["fetch", "origin", branch], RunOptions::default())?;
        Ok(())
    }

    /// Names of every local branch (`refs/heads/*`).
    pub fn local_heads(&self) -> anyhow::Result<Vec<String>> {
        let args = ["show-ref", "--heads"];
        let output = self.run(&args, RunOptions::default())?;
        // Exit 1 means there are no heads at all.
        if output.exit_code == 1 {
            return Ok(Vec::new());
        }
        let output = check(&args, output)?;
        Ok(parse_show_ref_heads(&output.stdout))
    }

    pub fn delete_ref(&self, reference: &str) -> anyhow::Result<()> {
        self.run_checked(&["update-ref", "-d", reference], RunOptions::default())?;
        Ok(())
    }

    pub fn list_worktrees(&self) -> anyhow::Result<Vec<Worktree>> {
        let stdout = self.run_command(&["worktree", "list", "--porcelain"])?;
        parse_worktree_list(&stdout)
    }

    /// Branches checked out by any worktree of this repository.
    pub fn worktree_branches(&self) -> anyhow::Result<HashSet<String>> {
        Ok(self
            .list_worktrees()?
            .into_iter()
            .filter_map(|wt| wt.branch)
            .collect())
    }

    pub fn worktree_add_existing(&self, path: &Path, branch: &str) -> anyhow::Result<()> {
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "add", &path, branch], RunOptions::show_output())?;
        Ok(())
    }

    pub fn worktree_add_new_branch(
        &self,
        branch: &str,
        path: &Path,
        base_ref: &str,
    ) -> anyhow::Result<()> {
        let path = path.to_string_lossy();
        self.run_checked(
            &["worktree", "add", "-b", branch, &path, base_ref],
            RunOptions::show_output(),
        )?;
        Ok(())
    }

    pub fn worktree_add_tracking(
        &self,
        branch: &str,
        path: &Path,
        remote_ref: &str,
    ) -> anyhow::Result<()> {
        let path = path.to_string_lossy();
        self.run_checked(
            &["worktree", "add", "-b", branch, "--track", &path, remote_ref],
            RunOptions::show_output(),
        )?;
        Ok(())
    }

    pub fn worktree_remove(&self, path: &Path, force: bool) -> anyhow::Result<()> {
        let path = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path);
        self.run_checked(&args, RunOptions::default())?;
        Ok(())
    }

    pub fn rename_branch(&self, from: &str, to: &str) -> anyhow::Result<()> {
        self.run_checked(&["branch", "-m", from, to], RunOptions::default())?;
        Ok(())
    }

    /// Raw `git status --porcelain=v2 -b`.
    pub fn status_porcelain(&self) -> anyhow::Result<String> {
        self.run_command(&["status", "--porcelain=v2", "-b"])
    }

    /// This checkout's own git directory, as an absolute path.
    pub fn git_dir(&self) -> anyhow::Result<PathBuf> {
        let stdout = self.run_command(&["rev-parse", "--path-format=absolute", "--git-dir"])?;
        Ok(PathBuf::from(stdout.trim()))
    }

    /// The shared object store, as an absolute path.
    pub fn git_common_dir(&self) -> anyhow::Result<PathBuf> {
        let stdout = self.run_command(&["rev-parse", "--path-format=absolute", "--git-common-dir"])?;
        Ok(PathBuf::from(stdout.trim()))
    }

    pub fn remote_get_url(&self, name: &str) -> anyhow::Result<String> {
        Ok(self.run_command(&["remote", "get-url", name])?.trim().to_string())
    }

    pub fn remote_set_url(&self, name: &str, url: &str) -> anyhow::Result<()> {
        self.run_checked(&["remote", "set-url", name, url], RunOptions::default())?;
        Ok(())
    }
}

fn ref_absent(output: &GitOutput) -> bool {
    output.exit_code == 1
        || (output.exit_code == 128 && output.stderr.contains("not a valid ref"))
}

fn parse_worktree_list(output: &str) -> anyhow::Result<Vec<Worktree>> {
    let mut worktrees = Vec::new();
    let mut current = None;

    for line in output.lines() {
        if line.is_empty() {
            if let Some(wt) = current.take() {
                worktrees.push(wt);
            }
            continue;
        }

        let (key, value) = match line.split_once(' ') {
            Some((k, v)) => (k, Some(v)),
            None => (line, None),
        };

        match key {
            "worktree" => {
                let Some(path) = value else {
                    anyhow::bail!("worktree line missing path");
                };
                if let Some(wt) = current.replace(Worktree {
                    path: PathBuf::from(path),
                    head: String::new(),
                    branch: None,
                    bare: false,
                    detached: false,
                    locked: None,
                    prunable: None,
                }) {
                    worktrees.push(wt);
                }
            }
            "HEAD" => {
                if let Some(ref mut wt) = current {
                    wt.head = value.unwrap_or_default().to_string();
                }
            }
            "branch" => {
                if let Some(ref mut wt) = current {
                    let branch_ref = value.unwrap_or_default();
                    let branch = branch_ref.strip_prefix("refs/heads/").unwrap_or(branch_ref);
                    if !branch.is_empty() {
                        wt.branch = Some(branch.to_string());
                    }
                }
            }
            "bare" => {
                if let Some(ref mut wt) = current {
                    wt.bare = true;
                }
            }
            "detached" => {
                if let Some(ref mut wt) = current {
                    wt.detached = true;
                }
            }
            "locked" => {
                if let Some(ref mut wt) = current {
                    wt.locked = Some(value.unwrap_or("").to_string());
                }
            }
            "prunable" => {
                if let Some(ref mut wt) = current {
                    wt.prunable = Some(value.unwrap_or("").to_string());
                }
            }
            _ => {
                // Ignore unknown attributes for forward compatibility
            }
        }
    }

    // Push the last worktree if the output doesn't end with a blank line
    if let Some(wt) = current {
        worktrees.push(wt);
    }

    Ok(worktrees)
}

/// Parse `ls-remote --symref origin HEAD`:
///
/// ```text
/// ref: refs/heads/main	HEAD
/// 3f2a...	HEAD
/// ```
fn parse_ls_remote_head(output: &str) -> RemoteHead {
    let mut head = RemoteHead::default();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((value, name)) = line.split_once('\t') else {
            continue;
        };
        if name.trim() != "HEAD" {
            continue;
        }
        if let Some(symref) = value.strip_prefix("ref: ") {
            let branch = symref.trim();
            let branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);
            if !branch.is_empty() {
                head.branch = Some(branch.to_string());
            }
        } else if let Some(hash) = value.split_whitespace().next() {
            head.hash = Some(hash.to_string());
        }
    }
    head
}

fn parse_show_ref_heads(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let (Some(_hash), Some(reference), None) =
                (fields.next(), fields.next(), fields.next())
            else {
                return None;
            };
            reference
                .strip_prefix("refs/heads/")
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        })
        .collect()
}
