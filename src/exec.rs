//! External process execution with bounded timeouts.
//!
//! Every git, build and test invocation goes through [`CommandRunner`] so that
//! no child process can block the pipeline indefinitely. On timeout the child
//! is killed together with everything it spawned, and
//! [`ExitOutcome::TimedOut`] is returned instead of an error; callers decide
//! which verdict a timeout maps to.
//!
//! Output is read line by line while the process runs and echoed at trace
//! level. Long-running commands can cap how much of it is kept.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Default timeout applied when a spec does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// How long output readers may keep running after the process ended.
/// A detached grandchild can hold the pipes open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Description of a single process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Working directory, inherited when `None`.
    pub cwd: Option<PathBuf>,
    /// Upper bound on wall-clock time.
    pub timeout: Duration,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Keep only the last this many lines of each output stream.
    pub capture_lines: Option<usize>,
}

impl CommandSpec {
    /// Creates a spec for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: DEFAULT_TIMEOUT,
            env: Vec::new(),
            capture_lines: None,
        }
    }

    /// Builds a spec from an argv vector. Returns `None` for an empty argv.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args.iter().cloned()))
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Sets the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Bounds captured stdout and stderr to their last `lines` lines.
    pub fn capture_lines(mut self, lines: usize) -> Self {
        self.capture_lines = Some(lines);
        self
    }

    /// Returns the command line as a single string, for logs and matching.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited normally with the given code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled,
    /// Killed after exceeding its timeout.
    TimedOut,
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "exit code {}", code),
            ExitOutcome::Signaled => write!(f, "terminated by signal"),
            ExitOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// How the process ended.
    pub outcome: ExitOutcome,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl CommandOutput {
    /// Creates an output with the given outcome and stdout, for runners that
    /// do not launch real processes.
    pub fn with_outcome(outcome: ExitOutcome, stdout: impl Into<String>) -> Self {
        Self {
            outcome,
            stdout: stdout.into(),
            stderr: String::new(),
            duration: Duration::ZERO,
        }
    }

    /// Returns true if the process exited with code 0.
    pub fn success(&self) -> bool {
        self.outcome == ExitOutcome::Exited(0)
    }

    /// Returns a short failure description, or `None` on success.
    pub fn failure_detail(&self) -> Option<String> {
        if self.success() {
            return None;
        }
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            Some(self.outcome.to_string())
        } else {
            Some(format!("{}: {}", self.outcome, tail(stderr, 20)))
        }
    }
}

/// Returns the last `lines` lines of `text`.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Executes external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the command to completion or until its timeout expires.
    ///
    /// A non-zero exit is reported through [`CommandOutput::outcome`], not as
    /// an error. Errors are reserved for failing to launch the process.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Tail of one output stream.
#[derive(Debug, Default)]
struct LineTail {
    lines: VecDeque<String>,
    dropped: usize,
    limit: Option<usize>,
}

type SharedTail = Arc<Mutex<LineTail>>;

impl LineTail {
    fn shared(limit: Option<usize>) -> SharedTail {
        Arc::new(Mutex::new(Self {
            limit,
            ..Self::default()
        }))
    }

    fn push(&mut self, line: String) {
        if let Some(limit) = self.limit {
            if limit == 0 {
                self.dropped += 1;
                return;
            }
            if self.lines.len() >= limit {
                self.lines.pop_front();
                self.dropped += 1;
            }
        }
        self.lines.push_back(line);
    }

    fn text(&self) -> String {
        let mut text = String::new();
        if self.dropped > 0 {
            text.push_str(&format!("[{} earlier lines omitted]\n", self.dropped));
        }
        for line in &self.lines {
            text.push_str(line);
        }
        text
    }
}

fn take_text(tail: &SharedTail) -> String {
    // A reader that panicked mid-push leaves a usable tail.
    tail.lock().unwrap_or_else(|e| e.into_inner()).text()
}

/// Reads `pipe` to EOF, echoing each line and appending it to `tail`.
async fn capture<R>(pipe: R, stream: &'static str, program: String, tail: SharedTail)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                tracing::trace!(program = %program, stream, line = %line.trim_end(), "output");
                tail.lock().unwrap_or_else(|e| e.into_inner()).push(line);
            }
            Err(e) => {
                tracing::debug!(program = %program, stream, error = %e, "output read failed");
                break;
            }
        }
    }
}

/// Waits for the output readers, abandoning any still blocked after the
/// grace period.
async fn drain(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut reader)
            .await
            .is_err()
        {
            tracing::debug!("output pipe still open after exit, abandoning reader");
            reader.abort();
        }
    }
}

/// Sends SIGKILL to the process group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg takes no pointers; the group was created for this child.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(
            pid,
            error = %std::io::Error::last_os_error(),
            "failed to kill process group"
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Runner that launches real processes with tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    /// Creates a new system runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!(
            command = %spec.command_line(),
            cwd = ?spec.cwd,
            timeout_secs = spec.timeout.as_secs(),
            "running command"
        );

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout reaches the whole tree.
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| Error::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();

        let stdout = LineTail::shared(spec.capture_lines);
        let stderr = LineTail::shared(spec.capture_lines);
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push(tokio::spawn(capture(
                pipe,
                "stdout",
                spec.program.clone(),
                stdout.clone(),
            )));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(tokio::spawn(capture(
                pipe,
                "stderr",
                spec.program.clone(),
                stderr.clone(),
            )));
        }

        let outcome = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(Ok(status)) => match status.code() {
                Some(code) => ExitOutcome::Exited(code),
                None => ExitOutcome::Signaled,
            },
            Ok(Err(e)) => {
                drain(readers).await;
                return Err(Error::Io(e));
            }
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "child already gone after group kill");
                }
                tracing::warn!(
                    command = %spec.command_line(),
                    timeout_secs = spec.timeout.as_secs(),
                    "command timed out, killed"
                );
                ExitOutcome::TimedOut
            }
        };

        drain(readers).await;
        let result = CommandOutput {
            outcome,
            stdout: take_text(&stdout),
            stderr: take_text(&stderr),
            duration: start.elapsed(),
        };
        if outcome != ExitOutcome::TimedOut && !result.success() {
            tracing::warn!(
                command = %spec.command_line(),
                outcome = %result.outcome,
                "command failed"
            );
        }
        Ok(result)
    }
}
