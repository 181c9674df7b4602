//! Helpers for running child processes with timeouts and bounded output.
//!
//! Every child is spawned as the leader of its own process group. A timeout
//! kills the whole group, so launchers that fork workers do not keep the
//! output pipes (and the sequencer) alive past the deadline.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::exit_codes;

/// How long reader threads get to drain after the process group is killed.
const READER_GRACE: Duration = Duration::from_secs(5);
const READER_POLL: Duration = Duration::from_millis(20);
const CHUNK_BYTES: usize = 8192;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes produced but not kept in `stdout`.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Shell-style exit code (`128 + signal` for signalled children on Unix).
    pub fn exit_code(&self) -> i32 {
        if self.timed_out {
            return exit_codes::TIMED_OUT;
        }
        exit_code_of(self.status)
    }

    pub fn stderr_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).trim().to_string();
        if self.stderr_truncated > 0 {
            text.push_str(&format!(
                "\n[stderr truncated {} bytes]",
                self.stderr_truncated
            ));
        }
        text
    }
}

#[cfg(unix)]
pub fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => exit_codes::INVALID,
    }
}

#[cfg(not(unix))]
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(exit_codes::INVALID)
}

/// Spawn `cmd` with piped stdout/stderr as the leader of a new process group.
///
/// The raw `io::Error` is returned so callers can tell a missing or
/// non-executable program apart from other failures.
pub fn spawn_in_group(cmd: &mut Command, pipe_stdin: bool) -> std::io::Result<Child> {
    cmd.stdin(if pipe_stdin {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    debug!("spawning child process");
    cmd.spawn()
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory: the first bytes are kept, the rest is drained and counted.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut child = match spawn_in_group(&mut cmd, stdin.is_some()) {
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
        child_stdin.write_all(input).context("write stdin")?;
        // Dropping closes the pipe so the child sees EOF.
        drop(child_stdin);
    }

    let (stdout, stderr) = take_pipes(&mut child)?;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    finish(child, timeout, stdout_handle, stderr_handle)
}

/// Create (or truncate) a step log file and its parent directory.
pub fn open_step_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    File::create(path).with_context(|| format!("create log {}", path.display()))
}

/// Wait for a child spawned by [`spawn_in_group`], echoing its output live and tee-ing it to a
/// log file.
///
/// Output chunks are forwarded to the parent's stdout/stderr when `echo` is set, and appended
/// (flushed per chunk) to `log`. Both streams share the log file, so the log keeps their
/// interleaving. `CommandOutput` holds the last `output_limit_bytes` of each stream.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, logging = log.is_some()))]
pub fn wait_with_tee(
    mut child: Child,
    timeout: Duration,
    output_limit_bytes: usize,
    log: Option<File>,
    echo: bool,
) -> Result<CommandOutput> {
    let log_file: SharedLog = Arc::new(log.map(|file| Mutex::new(BufWriter::new(file))));

    let (stdout, stderr) = take_pipes(&mut child)?;
    let stdout_log = Arc::clone(&log_file);
    let stderr_log = Arc::clone(&log_file);
    let stdout_handle = thread::spawn(move || {
        let sink = echo.then_some(Echo::Stdout);
        read_stream_tail_with_tee(stdout, output_limit_bytes, sink, &stdout_log)
    });
    let stderr_handle = thread::spawn(move || {
        let sink = echo.then_some(Echo::Stderr);
        read_stream_tail_with_tee(stderr, output_limit_bytes, sink, &stderr_log)
    });

    let output = finish(child, timeout, stdout_handle, stderr_handle)?;

    if let Some(mutex) = &*log_file
        && let Ok(mut writer) = mutex.lock()
    {
        if output.timed_out {
            let _ = writeln!(writer, "[killed after {}s timeout]", timeout.as_secs());
        }
        writer.flush().context("flush step log")?;
    }
    Ok(output)
}

type Reader = JoinHandle<Result<(Vec<u8>, usize)>>;

fn take_pipes(child: &mut Child) -> Result<(std::process::ChildStdout, std::process::ChildStderr)> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    Ok((stdout, stderr))
}

/// Wait for the child and its output readers.
///
/// Readers hit EOF only when every process holding the pipes has exited. If
/// the group leader exits but descendants keep the pipes open until the
/// deadline, the group is killed and the command counts as timed out.
fn finish(
    mut child: Child,
    timeout: Duration,
    stdout_handle: Reader,
    stderr_handle: Reader,
) -> Result<CommandOutput> {
    let deadline = Instant::now().checked_add(timeout);
    let (status, mut timed_out) = wait_or_kill(&mut child, timeout)?;

    let drain_by = if timed_out {
        Instant::now().checked_add(READER_GRACE)
    } else {
        deadline
    };
    let mut drained = readers_finished_by(&stdout_handle, &stderr_handle, drain_by);
    if !drained {
        warn!("output still open after the child exited, killing its process group");
        kill_process_group(&child);
        timed_out = true;
        drained = readers_finished_by(
            &stdout_handle,
            &stderr_handle,
            Instant::now().checked_add(READER_GRACE),
        );
    }

    let ((stdout, stdout_truncated), (stderr, stderr_truncated)) = if drained {
        (
            join_output(stdout_handle).context("join stdout")?,
            join_output(stderr_handle).context("join stderr")?,
        )
    } else {
        // A descendant left the group and still holds the pipes; its readers are detached.
        warn!("output readers did not finish, abandoning captured output");
        ((Vec::new(), 0), (Vec::new(), 0))
    };

    if stdout_truncated > 0 || stderr_truncated > 0 {
        debug!(stdout_truncated, stderr_truncated, "output truncated");
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

fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => Ok((status, false)),
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing its process group"
            );
            kill_process_group(child);
            child.kill().context("kill command")?;
            let status = child.wait().context("wait command after kill")?;
            Ok((status, true))
        }
    }
}

/// SIGKILL every process in the child's group. The group outlives its
/// reaped leader while any member is alive.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(child.id()) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        debug!(%err, pgid, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

/// Poll until both readers finish; `None` waits without limit.
fn readers_finished_by(stdout: &Reader, stderr: &Reader, limit: Option<Instant>) -> bool {
    loop {
        if stdout.is_finished() && stderr.is_finished() {
            return true;
        }
        if limit.is_some_and(|limit| Instant::now() >= limit) {
            return false;
        }
        thread::sleep(READER_POLL);
    }
}

fn join_output(handle: Reader) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

#[derive(Debug, Clone, Copy)]
enum Echo {
    Stdout,
    Stderr,
}

type SharedLog = Arc<Option<Mutex<BufWriter<File>>>>;

/// Read a stream in chunks, forwarding each chunk to the echo sink and log and keeping the last
/// `limit` bytes.
fn read_stream_tail_with_tee<R: Read>(
    mut reader: R,
    limit: usize,
    echo: Option<Echo>,
    log_file: &SharedLog,
) -> Result<(Vec<u8>, usize)> {
    let mut tail: VecDeque<u8> = VecDeque::with_capacity(limit.min(CHUNK_BYTES));
    let mut dropped = 0usize;
    let mut chunk = [0u8; CHUNK_BYTES];

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("read output"),
        };
        let bytes = &chunk[..n];

        match echo {
            Some(Echo::Stdout) => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(bytes).and_then(|()| out.flush());
            }
            Some(Echo::Stderr) => {
                let _ = std::io::stderr().lock().write_all(bytes);
            }
            None => {}
        }

        if let Some(mutex) = &**log_file
            && let Ok(mut writer) = mutex.lock()
        {
            if let Err(e) = writer.write_all(bytes) {
                warn!(err = %e, "failed to write to step log");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush step log");
            }
        }

        tail.extend(bytes);
        if tail.len() > limit {
            let excess = tail.len() - limit;
            tail.drain(..excess);
            dropped += excess;
        }
    }

    Ok((tail.into(), dropped))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; CHUNK_BYTES];

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("read output"),
        };
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

/// Last `max_lines` lines of `bytes`, lossily decoded.
pub fn last_lines(bytes: &[u8], max_lines: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
