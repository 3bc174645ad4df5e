//! gion error types
//!
//! Uses anyhow for error propagation. `GionError` is the semantic enum for
//! the failures callers need to tell apart (validation, missing things,
//! conflicts, safety gates, git failures); recover it with
//! `err.downcast_ref::<GionError>()`, which also sees through `.context(..)`.

use std::fmt;

/// What kind of name failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum NameKind {
    Branch,
    WorkspaceId,
    Alias,
}

#[derive(Debug)]
pub enum GionError {
    /// Illegal branch name, workspace id or alias.
    InvalidName {
        kind: NameKind,
        name: String,
        reason: String,
    },
    /// A repository location that cannot be normalized to host/owner/repo.
    InvalidLocation { location: String, reason: String },
    /// Invalid workspace metadata.
    InvalidMetadata(String),
    /// Missing store, workspace, alias or ref.
    NotFound { what: &'static str, name: String },
    /// Duplicate alias or identity, or a target that already exists.
    AlreadyExists { what: &'static str, name: String },
    /// Working tree has local changes and the caller did not allow dirty removal.
    DirtyWorkingTree { alias: String },
    /// Status could not be collected and the caller did not allow it.
    StatusError { alias: String, message: String },
    /// The base-ref cascade found nothing to branch from.
    BaseRefNotFound { store: String },
    /// A git command exited non-zero.
    GitFailed {
        command: String,
        code: i32,
        stderr: String,
    },
    /// A background prefetch failed; carries the fetch's error message.
    PrefetchFailed { key: String, message: String },
    /// The caller's cancel token fired.
    Cancelled,
    /// A command hit its timeout.
    TimedOut { command: String },
}

impl fmt::Display for GionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GionError::InvalidName { kind, name, reason } => {
                write!(f, "invalid {kind} {name:?}: {reason}")
            }
            GionError::InvalidLocation { location, reason } => {
                write!(f, "invalid repo location {location:?}: {reason}")
            }
            GionError::InvalidMetadata(msg) => write!(f, "invalid workspace metadata: {msg}"),
            GionError::NotFound { what, name } => write!(f, "{what} not found: {name}"),
            GionError::AlreadyExists { what, name } => write!(f, "{what} already exists: {name}"),
            GionError::DirtyWorkingTree { alias } => {
                write!(f, "{alias} has uncommitted changes (use --force to discard them)")
            }
            GionError::StatusError { alias, message } => {
                write!(f, "could not check status of {alias}: {message}")
            }
            GionError::BaseRefNotFound { store } => {
                write!(f, "cannot detect a default base ref in {store}")
            }
            GionError::GitFailed {
                command,
                code,
                stderr,
            } => {
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    write!(f, "{command} failed (exit {code})")
                } else {
                    write!(f, "{command} failed (exit {code}): {stderr}")
                }
            }
            GionError::PrefetchFailed { key, message } => {
                write!(f, "prefetch {key} failed: {message}")
            }
            GionError::Cancelled => write!(f, "operation cancelled"),
            GionError::TimedOut { command } => write!(f, "{command} timed out"),
        }
    }
}

impl std::error::Error for GionError {}

impl GionError {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        GionError::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn already_exists(what: &'static str, name: impl Into<String>) -> Self {
        GionError::AlreadyExists {
            what,
            name: name.into(),
        }
    }

    pub fn invalid_name(kind: NameKind, name: &str, reason: impl Into<String>) -> Self {
        GionError::InvalidName {
            kind,
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this is one of the validation failures of the taxonomy.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            GionError::InvalidName { .. }
                | GionError::InvalidLocation { .. }
                | GionError::InvalidMetadata(_)
        )
    }
}

/// Exit code for the CLI, derived from the semantic error (if any).
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<GionError>() {
        Some(e) if e.is_validation() => 2,
        Some(GionError::NotFound { .. }) => 3,
        Some(GionError::AlreadyExists { .. }) => 4,
        Some(GionError::DirtyWorkingTree { .. } | GionError::StatusError { .. }) => 5,
        Some(GionError::Cancelled) => 130,
        _ => 1,
    }
}
