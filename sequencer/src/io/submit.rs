//! Batch submission through `qsub` (or a configured replacement).

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, instrument};

use crate::io::process::run_command_with_timeout;

pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(60);
const SUBMIT_OUTPUT_LIMIT_BYTES: usize = 64_000;

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Submission command; the script is written to its stdin.
    pub command: Vec<String>,
    /// Directory to submit from; becomes `PBS_O_WORKDIR` on the compute node.
    pub workdir: PathBuf,
    pub timeout: Duration,
}

/// Submit `script` and return the scheduler's job id.
#[instrument(skip_all, fields(command = ?request.command))]
pub fn submit_script(request: &SubmitRequest, script: &str) -> Result<String> {
    let (program, args) = request
        .command
        .split_first()
        .ok_or_else(|| anyhow!("submit.command must be a non-empty array"))?;

    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(&request.workdir);

    let output = run_command_with_timeout(
        cmd,
        Some(script.as_bytes()),
        request.timeout,
        SUBMIT_OUTPUT_LIMIT_BYTES,
    )
    .with_context(|| format!("run {program}"))?;

    if output.timed_out {
        bail!("{program} timed out after {:?}", request.timeout);
    }
    if !output.status.success() {
        bail!(
            "{program} failed with exit code {}: {}",
            output.exit_code(),
            output.stderr_lossy()
        );
    }
    let job_id = parse_job_id(&output.stdout)
        .ok_or_else(|| anyhow!("{program} printed no job id"))?;
    info!(job_id = %job_id, "job submitted");
    Ok(job_id)
}

/// The job id is the last non-empty line `qsub` prints.
fn parse_job_id(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(str::to_string)
}
