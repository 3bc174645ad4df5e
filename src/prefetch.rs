//! Prefetcher: deduplicated background fetches keyed by repo identity.
//!
//! The apply orchestrator starts a fetch for every store it is about to add
//! worktrees from, does its local removals meanwhile, then waits. At most one
//! fetch per identity is ever in flight for a given [`Prefetcher`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, select};

use crate::git::{GionError, RepoIdentity};
use crate::paths::Root;
use crate::store;
use crate::sync::CancelToken;

struct PrefetchTask {
    /// Disconnects when the fetch finishes.
    done: Receiver<()>,
    failure: Mutex<Option<String>>,
}

pub struct Prefetcher {
    tasks: Mutex<HashMap<String, Arc<PrefetchTask>>>,
    /// Bounds each fetch individually, never the caller.
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Prefetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Prefetcher")
            .field("tasks", &tasks.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Prefetcher {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Start fetching `location` in the background.
    ///
    /// Returns `false` when nothing was started because the store does not
    /// exist yet (the later add clones it). Returns `true` if a fetch for the
    /// identity is running or has run.
    pub fn start(&self, root: &Root, location: &str, cancel: &CancelToken) -> anyhow::Result<bool> {
        let location = location.trim();
        if location.is_empty() {
            return Ok(false);
        }
        let (_, exists) = store::exists(root, location)?;
        if !exists {
            log::debug!("prefetch skipped for {location}: no store yet");
            return Ok(false);
        }
        let key = task_key(location);

        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let task = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            if tasks.contains_key(&key) {
                return Ok(true);
            }
            let task = Arc::new(PrefetchTask {
                done: rx,
                failure: Mutex::new(None),
            });
            tasks.insert(key.clone(), Arc::clone(&task));
            task
        };

        let root = root.clone();
        let location = location.to_string();
        let fetch_cancel = match self.timeout {
            Some(timeout) => cancel.with_timeout(timeout),
            None => cancel.clone(),
        };
        log::debug!("prefetch {key}");
        std::thread::spawn(move || {
            if let Err(e) = store::prefetch(&root, &location, &fetch_cancel) {
                log::debug!("prefetch {key} failed: {e:#}");
                *task.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(format!("{e:#}"));
            }
            drop(tx);
        });

        Ok(true)
    }

    /// Start every location. A location that cannot be started does not
    /// keep the rest from starting; the first such error is returned.
    pub fn start_all<'a>(
        &self,
        root: &Root,
        locations: impl IntoIterator<Item = &'a str>,
        cancel: &CancelToken,
    ) -> anyhow::Result<bool> {
        let mut started = false;
        let mut first_err = None;
        for location in locations {
            match self.start(root, location, cancel) {
                Ok(s) => started |= s,
                Err(e) => {
                    log::debug!("prefetch not started for {location}: {e:#}");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(started),
        }
    }

    /// Block until the fetch for `location` finishes or `cancel` fires.
    ///
    /// Waiting for an identity that was never started succeeds immediately.
    pub fn wait(&self, location: &str, cancel: &CancelToken) -> anyhow::Result<()> {
        let location = location.trim();
        if location.is_empty() {
            return Ok(());
        }
        let key = task_key(location);
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        let Some(task) = task else {
            return Ok(());
        };
        if cancel.is_cancelled() {
            return Err(GionError::Cancelled.into());
        }

        let expired = cancel.expired();
        select! {
            recv(task.done) -> _ => {}
            recv(cancel.done()) -> _ => return Err(GionError::Cancelled.into()),
            recv(expired) -> _ => {
                return Err(GionError::TimedOut {
                    command: format!("prefetch {key}"),
                }
                .into());
            }
        }

        let failure = task
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match failure {
            Some(message) => Err(GionError::PrefetchFailed { key, message }.into()),
            None => Ok(()),
        }
    }

    /// Wait for each location in turn, stopping at the first failure.
    pub fn wait_all<'a>(
        &self,
        locations: impl IntoIterator<Item = &'a str>,
        cancel: &CancelToken,
    ) -> anyhow::Result<()> {
        for location in locations {
            self.wait(location, cancel)?;
        }
        Ok(())
    }
}

/// Identity key, or the raw location if it does not normalize.
fn task_key(location: &str) -> String {
    RepoIdentity::parse(location)
        .map(|identity| identity.key())
        .unwrap_or_else(|_| location.trim().to_string())
}
