//! Ordered execution of a job plan under a failure policy.

use std::time::Instant;

use anyhow::Result;
use tracing::{info, warn};

use crate::core::plan::{Invocation, JobPlan};
use crate::core::types::{FailurePolicy, JobOutcome, StepRecord, StepStatus};
use crate::exit_codes;
use crate::io::launcher::{ProcessResult, ProcessRunner};

/// Run every step of `plan` in order, blocking on each.
///
/// - `ContinueOnFailure`: all steps run; the job exit code is the last step's.
/// - `StopOnFailure`: the first non-zero step ends the job; the rest are skipped.
///
/// `deadline` bounds the whole job. A step still running at the deadline is
/// killed, and steps that would start after it are skipped with exit code
/// [`exit_codes::TIMED_OUT`].
pub fn run_sequence<R: ProcessRunner>(
    plan: &JobPlan,
    runner: &R,
    policy: FailurePolicy,
    deadline: Instant,
) -> Result<JobOutcome> {
    let mut steps = Vec::with_capacity(plan.steps.len());
    let mut exit_code = exit_codes::OK;
    let mut halted = false;

    for invocation in &plan.steps {
        if halted {
            steps.push(skipped(invocation));
            continue;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(step = invocation.step.as_str(), "no time left before deadline, skipping");
            steps.push(skipped(invocation));
            exit_code = exit_codes::TIMED_OUT;
            halted = true;
            continue;
        }

        let started = Instant::now();
        let result = runner.run(invocation, remaining)?;
        let code = result.exit_code();
        let status = match result {
            ProcessResult::Exited(0) => StepStatus::Succeeded,
            ProcessResult::Exited(_) => StepStatus::Failed,
            ProcessResult::NotFound => StepStatus::NotFound,
            ProcessResult::TimedOut => StepStatus::TimedOut,
        };
        info!(step = invocation.step.as_str(), exit_code = code, ?status, "step finished");
        steps.push(StepRecord {
            step: invocation.step,
            command: invocation.command_line(),
            status,
            exit_code: Some(code),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        exit_code = code;

        if status == StepStatus::TimedOut {
            halted = true;
        } else if code != exit_codes::OK && policy == FailurePolicy::StopOnFailure {
            info!(step = invocation.step.as_str(), "stopping after failed step");
            halted = true;
        }
    }

    Ok(JobOutcome {
        policy,
        steps,
        exit_code,
    })
}

fn skipped(invocation: &Invocation) -> StepRecord {
    StepRecord {
        step: invocation.step,
        command: invocation.command_line(),
        status: StepStatus::Skipped,
        exit_code: None,
        duration_ms: 0,
    }
}
