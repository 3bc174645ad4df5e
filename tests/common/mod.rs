use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gion::git::{GitOutput, GitRunner, RunOptions, SystemGit};
use gion::paths::Root;
use gion::sync::CancelToken;
use gion::workspace::worktree::{self, AddRepo, AddedRepo};
use rstest::fixture;
use tempfile::TempDir;

pub const HOST: &str = "example.com";
pub const OWNER: &str = "acme";

/// A root directory plus local `file://` remotes to clone from.
pub struct TestEnv {
    temp_dir: TempDir,
    pub git: Arc<RecordingGit>,
    pub root: Root,
    pub cancel: CancelToken,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        // Canonicalize so paths match what git reports (macOS /var -> /private/var)
        let base = dunce::canonicalize(temp_dir.path()).expect("Failed to canonicalize temp path");
        let root_dir = base.join("root");
        std::fs::create_dir(&root_dir).expect("Failed to create root directory");

        let git = Arc::new(RecordingGit::default());
        let root = Root::with_git(root_dir, git.clone());

        Self {
            temp_dir,
            git,
            root,
            cancel: CancelToken::new(),
        }
    }

    fn base(&self) -> PathBuf {
        dunce::canonicalize(self.temp_dir.path()).expect("Failed to canonicalize temp path")
    }

    /// Create `<tmp>/remotes/example.com/acme/<name>.git` with one commit on `main`.
    pub fn remote(&self, name: &str) -> TestRemote {
        let base = self.base();
        let work = base.join("work").join(name);
        let bare = base
            .join("remotes")
            .join(HOST)
            .join(OWNER)
            .join(format!("{name}.git"));
        std::fs::create_dir_all(&work).expect("Failed to create work directory");
        std::fs::create_dir_all(bare.parent().unwrap()).expect("Failed to create remotes directory");

        run_git(&work, &["init", "-b", "main"]);
        let remote = TestRemote {
            location: format!("file://{}", bare.display()),
            work,
            bare,
        };
        remote.commit("initial");
        run_git(
            remote.work.parent().unwrap(),
            &[
                "clone",
                "--bare",
                "--quiet",
                remote.work.to_str().unwrap(),
                remote.bare.to_str().unwrap(),
            ],
        );
        run_git(
            &remote.work,
            &["remote", "add", "origin", remote.bare.to_str().unwrap()],
        );
        remote
    }

    /// Add `remote` to an existing workspace with default alias and branch.
    pub fn add(&self, workspace_id: &str, remote: &TestRemote) -> AddedRepo {
        worktree::add(
            &self.root,
            workspace_id,
            &AddRepo::new(&remote.location),
            &self.cancel,
        )
        .expect("Failed to add repo to workspace")
    }
}

#[fixture]
pub fn env() -> TestEnv {
    TestEnv::new()
}

/// Upstream repository: a bare remote plus the working copy that pushes to it.
pub struct TestRemote {
    pub location: String,
    pub work: PathBuf,
    pub bare: PathBuf,
}

impl TestRemote {
    /// Commit a change on whatever is checked out in the working copy.
    pub fn commit(&self, message: &str) {
        std::fs::write(self.work.join("file.txt"), message).expect("Failed to write file");
        run_git(&self.work, &["add", "file.txt"]);
        run_git(&self.work, &["commit", "--quiet", "-m", message]);
    }

    /// Commit on `main` and push it.
    pub fn push_main(&self, message: &str) {
        self.commit(message);
        run_git(&self.work, &["push", "--quiet", "origin", "main"]);
    }

    /// Push a new branch with one commit on top of `main`.
    pub fn push_branch(&self, branch: &str) {
        run_git(&self.work, &["checkout", "--quiet", "-b", branch]);
        self.commit(&format!("work on {branch}"));
        run_git(&self.work, &["push", "--quiet", "origin", branch]);
        run_git(&self.work, &["checkout", "--quiet", "main"]);
    }
}

/// Run git with an isolated config, panicking on failure.
pub fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=Test User", "-c", "user.email=test@example.com"])
        .args(["-c", "commit.gpgsign=false"])
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_CONFIG_SYSTEM", "/dev/null")
        .env("LC_ALL", "C")
        .output()
        .expect("Failed to run git");
    if !output.status.success() {
        panic!(
            "git {} failed in {}:\nstdout: {}\nstderr: {}",
            args.join(" "),
            dir.display(),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Wraps the real git, recording every invocation. Fetches can be delayed or
/// made to fail.
#[derive(Default)]
pub struct RecordingGit {
    inner: SystemGit,
    calls: Mutex<Vec<Vec<String>>>,
    fail_fetch: AtomicBool,
    fetch_delay: Mutex<Option<Duration>>,
}

impl RecordingGit {
    pub fn fetch_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|args| args.first().is_some_and(|a| a == "fetch"))
            .count()
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn delay_fetches(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl GitRunner for RecordingGit {
    fn run(
        &self,
        cancel: &CancelToken,
        dir: Option<&Path>,
        args: &[&str],
        opts: RunOptions,
    ) -> anyhow::Result<GitOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(args.iter().map(|a| a.to_string()).collect());

        if args.first() == Some(&"fetch") {
            let delay = *self.fetch_delay.lock().unwrap();
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            if self.fail_fetch.load(Ordering::SeqCst) {
                return Ok(GitOutput {
                    stdout: String::new(),
                    stderr: "fatal: unable to access remote".into(),
                    exit_code: 128,
                });
            }
        }

        self.inner.run(cancel, dir, args, opts)
    }
}
