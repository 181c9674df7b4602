//! Process runner abstraction for job steps.
//!
//! The [`ProcessRunner`] trait decouples sequencing from actual process
//! spawning. Tests use recording runners that return scripted results without
//! spawning anything.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::environment::resolve_program;
use crate::core::plan::Invocation;
use crate::exit_codes;
use crate::io::process::{last_lines, open_step_log, spawn_in_group, wait_with_tee};

/// Lines of stderr reported when a step fails.
const STDERR_TAIL_LINES: usize = 20;

/// How a step's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// The process ran to completion (any exit code, including signals as `128 + n`).
    Exited(i32),
    /// The program could not be found or spawned.
    NotFound,
    /// The process was killed at the deadline.
    TimedOut,
}

impl ProcessResult {
    pub fn exit_code(&self) -> i32 {
        match self {
            ProcessResult::Exited(code) => *code,
            ProcessResult::NotFound => exit_codes::COMMAND_NOT_FOUND,
            ProcessResult::TimedOut => exit_codes::TIMED_OUT,
        }
    }
}

/// Abstraction over how a job step is executed.
pub trait ProcessRunner {
    /// Run `invocation` to completion, killing it after `timeout`.
    ///
    /// Errors are reserved for sequencer-side failures such as an unwritable
    /// log directory; a failing child is an `Ok` result.
    fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ProcessResult>;
}

/// Runner that spawns real processes with the invocation's environment only.
#[derive(Debug, Clone)]
pub struct SystemProcessRunner {
    /// Directory for per-step logs (`<step>.log`); `None` disables logging.
    pub log_dir: Option<PathBuf>,
    pub output_limit_bytes: usize,
    /// Forward child output to our stdout/stderr as it arrives.
    pub echo: bool,
}

impl ProcessRunner for SystemProcessRunner {
    #[instrument(skip_all, fields(step = invocation.step.as_str(), timeout_secs = timeout.as_secs()))]
    fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ProcessResult> {
        let Some(program) =
            resolve_program(&invocation.program, &invocation.env, &invocation.workdir)
        else {
            warn!(program = %invocation.program, "program not found on child PATH");
            return Ok(ProcessResult::NotFound);
        };

        let log = match &self.log_dir {
            Some(dir) => Some(open_step_log(
                &dir.join(format!("{}.log", invocation.step.as_str())),
            )?),
            None => None,
        };

        info!(command = %invocation.command_line(), workdir = %invocation.workdir.display(), "starting step");
        let mut cmd = Command::new(&program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.workdir)
            .env_clear()
            .envs(&invocation.env);

        let child = match spawn_in_group(&mut cmd, false) {
            Ok(child) => child,
            Err(err) => return classify_spawn_error(err, &program),
        };
        let output = wait_with_tee(child, timeout, self.output_limit_bytes, log, self.echo)?;

        if output.timed_out {
            warn!(step = invocation.step.as_str(), "step killed at deadline");
            return Ok(ProcessResult::TimedOut);
        }
        let code = output.exit_code();
        if code != exit_codes::OK && !output.stderr.is_empty() {
            warn!(
                step = invocation.step.as_str(),
                exit_code = code,
                stderr_tail = %last_lines(&output.stderr, STDERR_TAIL_LINES),
                "step failed"
            );
        }
        debug!(step = invocation.step.as_str(), exit_code = code, "step exited");
        Ok(ProcessResult::Exited(code))
    }
}

/// Map spawn failures to shell conventions; anything else is a sequencer error.
fn classify_spawn_error(err: std::io::Error, program: &Path) -> Result<ProcessResult> {
    match err.kind() {
        ErrorKind::NotFound => Ok(ProcessResult::NotFound),
        ErrorKind::PermissionDenied => Ok(ProcessResult::Exited(exit_codes::NOT_EXECUTABLE)),
        _ => Err(err).with_context(|| format!("spawn {}", program.display())),
    }
}
