//! Run records under `<state_dir>/runs/<run-id>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::environment::EnvMap;
use crate::core::types::JobOutcome;

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub record_path: PathBuf,
}

impl RunPaths {
    pub fn new(state_dir: &Path, run_id: &str) -> Self {
        let dir = state_dir.join("runs").join(run_id);
        Self {
            record_path: dir.join("run.json"),
            dir,
        }
    }
}

/// Audit record of one `sequencer run`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: String,
    pub job_name: String,
    pub workdir: PathBuf,
    pub started_at: String,
    pub ended_at: String,
    pub outcome: JobOutcome,
}

/// Run id: the scheduler job id when present, else a local timestamp id.
///
/// Characters outside `[A-Za-z0-9._-]` are replaced with `_` so the id is a
/// safe directory name.
pub fn run_id_from_env(env: &EnvMap) -> String {
    match env.get("PBS_JOBID").filter(|id| !id.trim().is_empty()) {
        Some(job_id) => sanitize_id(job_id.trim()),
        None => format!(
            "local-{}-{}",
            chrono::Utc::now().format("%Y%m%dT%H%M%S"),
            std::process::id()
        ),
    }
}

fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// RFC 3339 UTC timestamp for record fields.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn write_run_record(paths: &RunPaths, record: &RunRecord) -> Result<()> {
    debug!(path = %paths.record_path.display(), run_id = %record.run_id, "writing run record");
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create run dir {}", paths.dir.display()))?;
    let mut buf = serde_json::to_string_pretty(record).context("serialize run record")?;
    buf.push('\n');
    fs::write(&paths.record_path, buf)
        .with_context(|| format!("write {}", paths.record_path.display()))
}

pub fn load_run_record(path: &Path) -> Result<RunRecord> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FailurePolicy, StepKind, StepRecord, StepStatus};

    #[test]
    fn run_id_prefers_scheduler_job_id() {
        let mut env = EnvMap::new();
        env.insert("PBS_JOBID".to_string(), "1234.pbs01/x".to_string());
        assert_eq!(run_id_from_env(&env), "1234.pbs01_x");
    }

    #[test]
    fn local_run_id_without_scheduler() {
        let id = run_id_from_env(&EnvMap::new());
        assert!(id.starts_with("local-"));
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn record_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(temp.path(), "run-1");
        let record = RunRecord {
            run_id: "run-1".to_string(),
            job_name: "ddp_mnist".to_string(),
            workdir: temp.path().to_path_buf(),
            started_at: "2026-01-01T00:00:00+00:00".to_string(),
            ended_at: "2026-01-01T00:05:00+00:00".to_string(),
            outcome: JobOutcome {
                policy: FailurePolicy::ContinueOnFailure,
                steps: vec![StepRecord {
                    step: StepKind::Ddp,
                    command: "torchrun ddp_mnist.py".to_string(),
                    status: StepStatus::Failed,
                    exit_code: Some(1),
                    duration_ms: 12,
                }],
                exit_code: 1,
            },
        };

        write_run_record(&paths, &record).expect("write");
        assert!(paths.record_path.ends_with(Path::new("runs/run-1/run.json")));
        let loaded = load_run_record(&paths.record_path).expect("load");
        assert_eq!(loaded, record);
    }
}
