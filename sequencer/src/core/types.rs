//! Shared deterministic types for the sequencer core.
//!
//! These types define the contracts between planning, sequencing and the run
//! record. They carry no I/O and must serialize identically across runs.

use serde::{Deserialize, Serialize};

/// What happens to later steps when a step exits non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Run every step regardless of earlier exit codes (plain shell script semantics).
    ContinueOnFailure,
    /// End the job at the first failing step.
    StopOnFailure,
}

/// Identity of a job step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Distributed data-parallel run through the launcher.
    Ddp,
    /// Single-process data-parallel run.
    Dp,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Ddp => "ddp",
            StepKind::Dp => "dp",
        }
    }
}

/// Outcome classification of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// The program could not be spawned.
    NotFound,
    /// Killed at the job deadline.
    TimedOut,
    /// Not run because of the failure policy or an exhausted deadline.
    Skipped,
}

/// Recorded result of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: StepKind,
    pub command: String,
    pub status: StepStatus,
    /// Shell-style exit code; `None` only for skipped steps.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Result of running the whole sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub policy: FailurePolicy,
    pub steps: Vec<StepRecord>,
    /// Exit code of the last step that ran.
    pub exit_code: i32,
}

impl JobOutcome {
    /// Number of steps that actually spawned (or tried to spawn) a process.
    pub fn invoked(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status != StepStatus::Skipped)
            .count()
    }
}
