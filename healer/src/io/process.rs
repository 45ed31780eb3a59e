//! Child processes with a hard wall-clock limit and bounded captured output.

use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured output of a finished (or killed) child.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes discarded beyond the capture limit, per stream.
    pub dropped_stdout: usize,
    pub dropped_stderr: usize,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Builder for a single bounded child-process invocation.
#[derive(Debug)]
pub struct TimedCommand {
    command: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    capture_limit: usize,
}

impl TimedCommand {
    pub fn new<S: AsRef<OsStr>>(program: S, timeout: Duration) -> Self {
        Self {
            command: Command::new(program),
            stdin: None,
            timeout,
            capture_limit: 1024 * 1024,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.command.current_dir(dir);
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn capture_limit(mut self, bytes: usize) -> Self {
        self.capture_limit = bytes;
        self
    }

    /// Spawn, feed stdin, drain both pipes concurrently and wait up to the
    /// timeout. A child still running at the deadline is killed together with
    /// its process group and reported with `timed_out = true`.
    #[instrument(skip_all, fields(
        program = ?self.command.get_program(),
        timeout_secs = self.timeout.as_secs(),
    ))]
    pub fn run(self) -> Result<ProcessOutput> {
        let Self {
            mut command,
            stdin,
            timeout,
            capture_limit,
        } = self;

        command
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own group, so descendants holding our pipes die with the child.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("spawn {:?}", command.get_program()))?;
        debug!(pid = child.id(), "spawned");

        let writer = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => Some(thread::spawn(move || -> Result<()> {
                pipe.write_all(&input).context("write stdin")?;
                Ok(())
            })),
            _ => None,
        };
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr not captured"))?;
        let stdout_reader = thread::spawn(move || drain_bounded(stdout, capture_limit));
        let stderr_reader = thread::spawn(move || drain_bounded(stderr, capture_limit));

        let (status, timed_out) = match child.wait_timeout(timeout).context("wait for child")? {
            Some(status) => (status, false),
            None => {
                warn!(timeout_secs = timeout.as_secs(), "deadline reached, killing child");
                kill_tree(&mut child)?;
                (child.wait().context("reap killed child")?, true)
            }
        };

        if let Some(writer) = writer {
            // A child that exits without reading stdin closes the pipe early.
            if let Err(err) = join(writer) {
                debug!(err = %err, "stdin not fully consumed");
            }
        }
        let (stdout, dropped_stdout) = join(stdout_reader).context("collect stdout")?;
        let (stderr, dropped_stderr) = join(stderr_reader).context("collect stderr")?;
        if dropped_stdout > 0 || dropped_stderr > 0 {
            warn!(dropped_stdout, dropped_stderr, "captured output truncated");
        }

        debug!(exit_code = ?status.code(), timed_out, "child finished");
        Ok(ProcessOutput {
            status,
            stdout,
            stderr,
            dropped_stdout,
            dropped_stderr,
            timed_out,
        })
    }
}

/// Kill the child's whole process group, falling back to the child alone.
#[cfg(unix)]
fn kill_tree(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).context("child pid out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => {
            warn!(err = %err, pgid, "process group kill failed");
            child.kill().context("kill child")
        }
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill child")
}

fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle
        .join()
        .map_err(|_| anyhow!("pipe thread panicked"))?
}

/// Read a stream to the end, keeping at most `limit` bytes.
fn drain_bounded<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read pipe")?;
        if n == 0 {
            return Ok((kept, dropped));
        }
        let room = limit.saturating_sub(kept.len()).min(n);
        kept.extend_from_slice(&chunk[..room]);
        dropped += n - room;
    }
}
