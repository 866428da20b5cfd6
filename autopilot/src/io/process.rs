//! Helpers for running child processes with timeouts, cancellation, and
//! bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::{Cancelled, ensure_active};

/// How often a waiting child is checked against the cancellation token.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// How long reader threads get to drain the pipes after a kill.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Combined stdout/stderr for reporting back to the planner.
    pub fn combined(&self) -> String {
        let mut buf = self.stdout_lossy();
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[stdout truncated {} bytes]",
                self.stdout_truncated
            ));
        }
        let stderr = self.stderr_lossy();
        if !stderr.trim().is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str("[stderr]\n");
            buf.push_str(&stderr);
        }
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[stderr truncated {} bytes]",
                self.stderr_truncated
            ));
        }
        buf
    }
}

/// Limits applied to one child process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. The child runs in its own
/// process group, and the whole group is killed when `timeout` elapses
/// (reported via `timed_out`) or when `cancel` fires (reported as a
/// [`Cancelled`] error). Blocks the calling thread.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), output_limit_bytes = limits.output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: ProcessLimits,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    ensure_active(cancel)?;
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    own_process_group(&mut cmd);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A child that exits without reading stdin closes the pipe early.
        if let Err(e) = child_stdin.write_all(input) {
            warn!(err = %e, "child closed stdin early");
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let deadline = Instant::now() + limits.timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let finished: Option<ExitStatus> = loop {
        if cancel.is_cancelled() {
            cancelled = true;
            break None;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            timed_out = true;
            break None;
        }
        if let Some(status) = child
            .wait_timeout(remaining.min(CANCEL_POLL))
            .context("wait for command")?
        {
            break Some(status);
        }
    };
    let status = match finished {
        Some(status) => status,
        None => {
            if timed_out {
                warn!(
                    timeout_secs = limits.timeout.as_secs(),
                    "command timed out, killing"
                );
            } else {
                warn!("command cancelled, killing");
            }
            kill_process_tree(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    // After a kill, a stray descendant may still hold the pipes open.
    let drain_deadline = finished.is_none().then(|| Instant::now() + DRAIN_GRACE);
    let (stdout, stdout_truncated) =
        join_output(stdout_handle, drain_deadline).context("join stdout")?;
    let (stderr, stderr_truncated) =
        join_output(stderr_handle, drain_deadline).context("join stderr")?;

    if cancelled {
        return Err(Cancelled.into());
    }
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Run [`run_command_with_timeout`] on the tokio blocking pool.
pub async fn run_command_async(
    cmd: Command,
    stdin: Option<Vec<u8>>,
    limits: ProcessLimits,
    cancel: CancellationToken,
) -> Result<CommandOutput> {
    tokio::task::spawn_blocking(move || {
        run_command_with_timeout(cmd, stdin.as_deref(), limits, &cancel)
    })
    .await
    .context("join blocking command task")?
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

/// Kill the child and everything it spawned.
#[cfg(unix)]
fn kill_process_tree(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).context("child pid out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => {
            warn!(err = %err, "failed to kill process group, killing child only");
            child.kill().context("kill command")
        }
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill command")
}

/// Join a reader thread, giving up at `deadline` if one is set.
fn join_output(
    handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>,
    deadline: Option<Instant>,
) -> Result<(Vec<u8>, usize)> {
    if let Some(deadline) = deadline {
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("output pipe still open after kill, abandoning reader");
                return Ok((Vec::new(), 0));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cancel::is_cancelled;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn limits(timeout_ms: u64, output_limit_bytes: usize) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_millis(timeout_ms),
            output_limit_bytes,
        }
    }

    #[test]
    fn captures_output_and_stdin() {
        let out = run_command_with_timeout(
            sh("cat; echo err >&2"),
            Some(b"hello"),
            limits(5_000, 1024),
            &CancellationToken::new(),
        )
        .expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout_lossy(), "hello");
        assert!(out.combined().contains("[stderr]\nerr"));
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let out = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            None,
            limits(5_000, 4),
            &CancellationToken::new(),
        )
        .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
    }

    #[test]
    fn kills_child_on_timeout() {
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("exec sleep 5"),
            None,
            limits(200, 1024),
            &CancellationToken::new(),
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 6; echo done"),
            None,
            limits(300, 1024),
            &CancellationToken::new(),
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.stdout_lossy().contains("done"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn kills_child_on_cancel() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            trigger.cancel();
        });
        let started = Instant::now();
        let err = run_command_with_timeout(
            sh("sleep 5 & sleep 5; wait"),
            None,
            limits(10_000, 1024),
            &token,
        )
        .unwrap_err();
        canceller.join().expect("join canceller");
        assert!(is_cancelled(&err));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
