//! Job configuration stored in `sequencer.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::invariants::validate_config;
use crate::core::resources::{MailEvent, ResourceRequest};
use crate::core::types::FailurePolicy;

pub const DEFAULT_CONFIG_PATH: &str = "sequencer.toml";

/// Job configuration (TOML).
///
/// Meant to be edited by humans. Every table is optional; missing fields take
/// the values of the reference MNIST job (1 node, 4 GPUs, 10 minutes).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobConfig {
    pub job: JobSection,
    pub resources: ResourceRequest,
    pub environment: EnvironmentSection,
    pub distributed: DistributedSection,
    pub single: SingleSection,
    pub policy: PolicySection,
    pub submit: SubmitSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobSection {
    /// Scheduler job name (`-N`).
    pub name: String,
    /// Account / billing identifier (`-A`). Empty means no directive.
    pub account: String,
    /// Notification address (`-M`). Empty means no directive.
    pub email: String,
    pub mail_events: Vec<MailEvent>,
}

impl Default for JobSection {
    fn default() -> Self {
        Self {
            name: "ddp_mnist".to_string(),
            account: String::new(),
            email: String::new(),
            mail_events: vec![MailEvent::Abort, MailEvent::Begin, MailEvent::End],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentSection {
    /// Environment modules loaded before any step, in order.
    pub modules: Vec<String>,
    /// Virtual environment directory, relative to the working directory.
    pub venv: PathBuf,
    /// Variable holding the submission directory.
    pub workdir_var: String,
    /// Shell used to evaluate `module load` (e.g. `["bash","-lc"]`).
    pub shell: Vec<String>,
}

impl Default for EnvironmentSection {
    fn default() -> Self {
        Self {
            modules: vec!["gcc".to_string(), "cuda".to_string(), "nccl".to_string()],
            venv: PathBuf::from("venv"),
            workdir_var: "PBS_O_WORKDIR".to_string(),
            shell: vec!["bash".to_string(), "-lc".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DistributedSection {
    /// Launcher command prefix (e.g. `["torchrun"]`).
    pub launcher: Vec<String>,
    pub nnodes: u32,
    pub nproc_per_node: u32,
    pub master_port: u32,
    pub entry_point: PathBuf,
}

impl Default for DistributedSection {
    fn default() -> Self {
        Self {
            launcher: vec!["torchrun".to_string()],
            nnodes: 1,
            nproc_per_node: 4,
            master_port: 29400,
            entry_point: PathBuf::from("ddp_mnist.py"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SingleSection {
    pub interpreter: String,
    pub entry_point: PathBuf,
}

impl Default for SingleSection {
    fn default() -> Self {
        Self {
            interpreter: "python".to_string(),
            entry_point: PathBuf::from("dp_mnist.py"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicySection {
    /// Run the single-process step even when the distributed step failed.
    pub continue_on_failure: bool,
    /// Keep at most this many bytes of each step's stdout/stderr in memory.
    pub output_limit_bytes: usize,
    /// Directory (relative to the working directory) for run records and logs.
    pub state_dir: PathBuf,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            continue_on_failure: true,
            output_limit_bytes: 100_000,
            state_dir: PathBuf::from(".sequencer"),
        }
    }
}

impl PolicySection {
    pub fn failure_policy(&self) -> FailurePolicy {
        if self.continue_on_failure {
            FailurePolicy::ContinueOnFailure
        } else {
            FailurePolicy::StopOnFailure
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SubmitSection {
    /// Submission command; the job script is fed on stdin.
    pub command: Vec<String>,
}

impl Default for SubmitSection {
    fn default() -> Self {
        Self {
            command: vec!["qsub".to_string()],
        }
    }
}

impl JobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.policy.output_limit_bytes == 0 {
            bail!("policy.output_limit_bytes must be > 0");
        }
        let errors = validate_config(self);
        if !errors.is_empty() {
            bail!("invalid job config:\n- {}", errors.join("\n- "));
        }
        Ok(())
    }
}

/// Load config from a TOML file without validating it.
///
/// If the file is missing, returns `JobConfig::default()`.
pub fn read_config(path: &Path) -> Result<JobConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        return Ok(JobConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: JobConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    debug!(path = %path.display(), job = %cfg.job.name, "config loaded");
    Ok(cfg)
}

/// Load and validate config from a TOML file.
pub fn load_config(path: &Path) -> Result<JobConfig> {
    let cfg = read_config(path)?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &JobConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
