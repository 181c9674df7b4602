//! Orchestration for `sequencer plan` and `sequencer run`.
//!
//! Resolves the submission directory and the child environment, builds the
//! plan, runs it, and writes the run record. Process spawning and module
//! loading come in through traits so the whole flow runs against fakes in
//! tests.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::core::environment::{EnvDiff, EnvMap, activate_venv, diff};
use crate::core::plan::{JobPlan, build_plan};
use crate::core::types::FailurePolicy;
use crate::io::config::JobConfig;
use crate::io::launcher::ProcessRunner;
use crate::io::modules::ModuleLoader;
use crate::io::run_log::{RunPaths, RunRecord, now_rfc3339, write_run_record};
use crate::sequence::run_sequence;

/// Pick the working directory: explicit override, then the scheduler's
/// submission directory variable, then the current directory.
pub fn resolve_workdir(
    cfg: &JobConfig,
    base_env: &EnvMap,
    override_dir: Option<&Path>,
) -> Result<PathBuf> {
    let var = &cfg.environment.workdir_var;
    let dir = match (override_dir, base_env.get(var).filter(|v| !v.is_empty())) {
        (Some(dir), _) => dir.to_path_buf(),
        (None, Some(submit_dir)) => PathBuf::from(submit_dir),
        (None, None) => {
            warn!(var = %var, "submission directory variable unset, using current directory");
            std::env::current_dir().context("read current directory")?
        }
    };
    if !dir.is_dir() {
        return Err(anyhow!("working directory {} does not exist", dir.display()));
    }
    dir.canonicalize()
        .with_context(|| format!("canonicalize {}", dir.display()))
}

/// A plan plus how its environment differs from the parent's.
#[derive(Debug, Clone)]
pub struct PreparedJob {
    pub plan: JobPlan,
    pub env_changes: EnvDiff,
}

/// Load modules, activate the venv and build the plan for `workdir`.
pub fn prepare_job<L: ModuleLoader>(
    cfg: &JobConfig,
    base_env: &EnvMap,
    workdir: &Path,
    loader: &L,
) -> Result<PreparedJob> {
    let loaded = loader
        .load(base_env, &cfg.environment.modules)
        .context("load environment modules")?;
    let venv = workdir.join(&cfg.environment.venv);
    let env = activate_venv(&loaded, &venv);
    let env_changes = diff(base_env, &env);
    debug!(
        added = env_changes.added.len(),
        changed = env_changes.changed.len(),
        removed = env_changes.removed.len(),
        "child environment resolved"
    );
    Ok(PreparedJob {
        plan: build_plan(cfg, workdir, &env),
        env_changes,
    })
}

/// Files the training steps expect. Missing ones are reported, not fatal:
/// the steps still run and fail the way they would under the plain script.
pub fn preflight(cfg: &JobConfig, workdir: &Path) -> Vec<String> {
    let mut warnings = Vec::new();
    let venv = workdir.join(&cfg.environment.venv);
    if !venv.join("bin").is_dir() {
        warnings.push(format!("virtual environment {} not found", venv.display()));
    }
    for entry in [&cfg.distributed.entry_point, &cfg.single.entry_point] {
        let path = workdir.join(entry);
        if !path.is_file() {
            warnings.push(format!("entry point {} not found", path.display()));
        }
    }
    warnings
}

/// Directory holding this run's record and step logs.
pub fn run_paths(cfg: &JobConfig, workdir: &Path, run_id: &str) -> RunPaths {
    RunPaths::new(&workdir.join(&cfg.policy.state_dir), run_id)
}

/// Inputs for one `sequencer run`.
#[derive(Debug, Clone)]
pub struct JobRun<'a> {
    pub cfg: &'a JobConfig,
    pub base_env: &'a EnvMap,
    pub workdir: &'a Path,
    pub policy: FailurePolicy,
    pub run_id: String,
}

/// Execute the job and persist its run record.
///
/// The walltime, counted from this call, is the deadline for all steps.
pub fn run_job<L: ModuleLoader, R: ProcessRunner>(
    job: &JobRun<'_>,
    loader: &L,
    runner: &R,
) -> Result<RunRecord> {
    let walltime = job.cfg.resources.walltime;
    let deadline = Instant::now()
        .checked_add(walltime.as_duration())
        .ok_or_else(|| anyhow!("walltime {walltime} cannot be scheduled as a deadline"))?;
    let started_at = now_rfc3339();
    info!(run_id = %job.run_id, workdir = %job.workdir.display(), policy = ?job.policy, "job starting");

    for warning in preflight(job.cfg, job.workdir) {
        warn!("{warning}");
    }

    let prepared = prepare_job(job.cfg, job.base_env, job.workdir, loader)?;
    let outcome = run_sequence(&prepared.plan, runner, job.policy, deadline)?;

    let record = RunRecord {
        run_id: job.run_id.clone(),
        job_name: job.cfg.job.name.clone(),
        workdir: job.workdir.to_path_buf(),
        started_at,
        ended_at: now_rfc3339(),
        outcome,
    };
    let paths = run_paths(job.cfg, job.workdir, &job.run_id);
    write_run_record(&paths, &record)?;
    info!(run_id = %job.run_id, exit_code = record.outcome.exit_code, "job finished");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{StepKind, StepStatus};
    use crate::io::launcher::ProcessResult;
    use crate::test_support::{RecordingRunner, StaticModuleLoader, TestWorkdir};

    fn base_env() -> EnvMap {
        let mut env = EnvMap::new();
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        env
    }

    #[test]
    fn workdir_comes_from_submission_variable() {
        let workdir = TestWorkdir::new().expect("workdir");
        let mut env = base_env();
        env.insert(
            "PBS_O_WORKDIR".to_string(),
            workdir.path().display().to_string(),
        );
        let resolved = resolve_workdir(&JobConfig::default(), &env, None).expect("resolve");
        assert_eq!(resolved, workdir.path().canonicalize().expect("canonicalize"));
    }

    #[test]
    fn missing_workdir_is_an_error() {
        let mut env = base_env();
        env.insert("PBS_O_WORKDIR".to_string(), "/no/such/dir".to_string());
        let err = resolve_workdir(&JobConfig::default(), &env, None).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn prepared_env_has_modules_then_venv() {
        let workdir = TestWorkdir::new().expect("workdir");
        let loader = StaticModuleLoader::new(&[("CUDA_HOME", "/opt/cuda"), ("PATH", "/opt/cuda/bin:/usr/bin")]);
        let prepared =
            prepare_job(&JobConfig::default(), &base_env(), workdir.path(), &loader).expect("prepare");

        let env = &prepared.plan.steps[0].env;
        let venv = workdir.path().join("venv");
        assert_eq!(env.get("CUDA_HOME").map(String::as_str), Some("/opt/cuda"));
        assert_eq!(
            env.get("PATH").cloned(),
            Some(format!("{}/bin:/opt/cuda/bin:/usr/bin", venv.display()))
        );
        assert_eq!(
            env.get("LOADEDMODULES").map(String::as_str),
            Some("gcc:cuda:nccl")
        );
        assert!(prepared.env_changes.added.contains_key("VIRTUAL_ENV"));
        assert!(prepared.env_changes.changed.contains_key("PATH"));
    }

    #[test]
    fn preflight_reports_missing_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let warnings = preflight(&JobConfig::default(), temp.path());
        assert_eq!(warnings.len(), 3);

        let workdir = TestWorkdir::new().expect("workdir");
        assert!(preflight(&JobConfig::default(), workdir.path()).is_empty());
    }

    #[test]
    fn run_job_writes_record_with_both_steps() {
        let workdir = TestWorkdir::new().expect("workdir");
        let cfg = JobConfig::default();
        let env = base_env();
        let runner = RecordingRunner::new(vec![ProcessResult::Exited(1), ProcessResult::Exited(0)]);
        let job = JobRun {
            cfg: &cfg,
            base_env: &env,
            workdir: workdir.path(),
            policy: FailurePolicy::ContinueOnFailure,
            run_id: "run-a".to_string(),
        };

        let record = run_job(&job, &StaticModuleLoader::new(&[]), &runner).expect("run");
        assert_eq!(runner.steps(), vec![StepKind::Ddp, StepKind::Dp]);
        assert_eq!(record.outcome.exit_code, 0);
        assert_eq!(record.outcome.steps[0].status, StepStatus::Failed);
        assert!(
            run_paths(&cfg, workdir.path(), "run-a")
                .record_path
                .is_file()
        );
    }

    #[test]
    fn unrepresentable_walltime_is_an_error() {
        let workdir = TestWorkdir::new().expect("workdir");
        let mut cfg = JobConfig::default();
        cfg.resources.walltime = crate::core::resources::Walltime::from_secs(u64::MAX);
        let env = base_env();
        let runner = RecordingRunner::new(Vec::new());
        let job = JobRun {
            cfg: &cfg,
            base_env: &env,
            workdir: workdir.path(),
            policy: FailurePolicy::ContinueOnFailure,
            run_id: "run-b".to_string(),
        };

        let err = run_job(&job, &StaticModuleLoader::new(&[]), &runner).unwrap_err();
        assert!(err.to_string().contains("cannot be scheduled"));
        assert!(runner.steps().is_empty());
    }
}
