//! Workspace fleet manager for git.
//!
//! A root directory holds one bare store per repository (`bare/`), a
//! convenience clone of each (`src/`) and any number of workspaces
//! (`workspaces/<id>/<alias>`), each a set of worktrees attached to the
//! stores.

pub mod apply;
pub mod config;
pub mod git;
pub mod paths;
pub mod prefetch;
pub mod shell_exec;
pub mod store;
pub mod sync;
pub mod workspace;
