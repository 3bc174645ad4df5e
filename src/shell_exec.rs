//! External command execution.
//!
//! Every git process gion starts goes through [`Cmd`]: it logs the command
//! line, limits how many processes run at once, and supervises the child so a
//! [`CancelToken`] or a per-command timeout can kill it mid-flight.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use wait_timeout::ChildExt;

use crate::git::GionError;
use crate::sync::{CancelToken, Interrupt, Semaphore};

/// Semaphore to limit concurrent command execution.
static CMD_SEMAPHORE: OnceLock<Semaphore> = OnceLock::new();

/// Monotonic epoch for trace timestamps.
static TRACE_EPOCH: OnceLock<Instant> = OnceLock::new();

fn trace_epoch() -> &'static Instant {
    TRACE_EPOCH.get_or_init(Instant::now)
}

/// Default concurrent external commands. Prefetch spawns one fetch per
/// repository, so this caps the process count for large plans.
pub const DEFAULT_CONCURRENT_COMMANDS: usize = 32;

/// How often a running child is polled for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn max_concurrent_commands() -> usize {
    std::env::var("GION_MAX_CONCURRENT_COMMANDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_CONCURRENT_COMMANDS)
}

fn get_semaphore() -> &'static Semaphore {
    CMD_SEMAPHORE.get_or_init(|| Semaphore::new(max_concurrent_commands()))
}

/// Set the process-wide command limit.
///
/// Only effective before the first command runs; later calls are ignored.
pub fn configure_max_concurrent_commands(limit: usize) {
    if CMD_SEMAPHORE.set(Semaphore::new(limit)).is_err() {
        log::debug!("command limit already initialized; ignoring {limit}");
    }
}

fn thread_id_number() -> u64 {
    let debug_str = format!("{:?}", std::thread::current().id());
    debug_str
        .strip_prefix("ThreadId(")
        .and_then(|s| s.strip_suffix(")"))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Builder for executing commands with logging, tracing and cancellation.
///
/// ```ignore
/// let output = Cmd::new("git")
///     .args(["status", "--porcelain=v2", "-b"])
///     .current_dir(&worktree)
///     .context("app")
///     .cancel(cancel.clone())
///     .run()?;
/// ```
pub struct Cmd {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    context: Option<String>,
    timeout: Option<Duration>,
    cancel: Option<CancelToken>,
    envs: Vec<(String, String)>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            context: None,
            timeout: None,
            cancel: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Set the logging context (typically a store key or alias).
    pub fn context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Kill the command if it runs longer than `duration`.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Kill the command when `token` is cancelled or reaches its deadline.
    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.envs.push((key.into(), val.into()));
        self
    }

    /// Command line as it would be typed in a shell.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| shell_escape::escape(part.into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Execute the command and return its output.
    ///
    /// A non-zero exit status is not an error here; callers inspect
    /// `output.status`. Errors are spawn failures, cancellation and timeouts.
    pub fn run(self) -> anyhow::Result<Output> {
        let cmd_str = self.display();
        match &self.context {
            Some(ctx) => log::debug!("$ {} [{}]", cmd_str, ctx),
            None => log::debug!("$ {}", cmd_str),
        }

        if let Some(reason) = self.cancel.as_ref().and_then(CancelToken::interrupted) {
            return Err(interrupt_error(reason, &cmd_str).into());
        }

        let _guard = get_semaphore().acquire();

        let t0 = Instant::now();
        let ts = t0.duration_since(*trace_epoch()).as_micros() as u64;
        let tid = thread_id_number();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        for (key, val) in &self.envs {
            cmd.env(key, val);
        }

        let result = supervise(&mut cmd, self.timeout, self.cancel.as_ref(), &cmd_str);

        let dur_us = t0.elapsed().as_micros() as u64;
        let ctx = self.context.as_deref().unwrap_or("-");
        match &result {
            Ok(output) => log::debug!(
                "[gion-trace] ts={} tid={} context={} cmd=\"{}\" dur_us={} ok={}",
                ts,
                tid,
                ctx,
                cmd_str,
                dur_us,
                output.status.success()
            ),
            Err(e) => log::debug!(
                "[gion-trace] ts={} tid={} context={} cmd=\"{}\" dur_us={} err=\"{}\"",
                ts,
                tid,
                ctx,
                cmd_str,
                dur_us,
                e
            ),
        }

        result
    }
}

fn interrupt_error(reason: Interrupt, cmd_str: &str) -> GionError {
    match reason {
        Interrupt::Cancelled => GionError::Cancelled,
        Interrupt::DeadlineExceeded => GionError::TimedOut {
            command: cmd_str.to_string(),
        },
    }
}

/// Spawn the child, drain its pipes on helper threads, and wait for it while
/// watching the timeout and the cancel token.
fn supervise(
    cmd: &mut Command,
    timeout: Option<Duration>,
    cancel: Option<&CancelToken>,
    cmd_str: &str,
) -> anyhow::Result<Output> {
    // Own process group, so an interrupt reaches helpers git spawns too.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to run {cmd_str}: {e}"))?;

    let mut stdout_handle = child.stdout.take();
    let mut stderr_handle = child.stderr.take();

    // Reading both pipes concurrently prevents a deadlock when one fills up.
    let stdout_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(ref mut handle) = stdout_handle {
            let _ = handle.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(ref mut handle) = stderr_handle {
            let _ = handle.read_to_end(&mut buf);
        }
        buf
    });

    let deadline = timeout.map(|t| Instant::now() + t);
    let status = loop {
        if let Some(status) = child.wait_timeout(POLL_INTERVAL)? {
            break status;
        }

        let interrupt = cancel.and_then(CancelToken::interrupted).or_else(|| {
            deadline
                .is_some_and(|d| Instant::now() >= d)
                .then_some(Interrupt::DeadlineExceeded)
        });
        if let Some(reason) = interrupt {
            kill_tree(&mut child);
            let _ = child.wait();
            // Not joined: a surviving grandchild may still hold the pipes.
            drop(stdout_thread);
            drop(stderr_thread);
            return Err(interrupt_error(reason, cmd_str).into());
        }
    };

    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();

    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        log::debug!("killpg {pgid} failed: {e}");
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}
