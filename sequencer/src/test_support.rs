//! Test-only fakes and fixtures for sequencer tests.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::environment::EnvMap;
use crate::core::plan::Invocation;
use crate::core::types::StepKind;
use crate::io::config::{JobConfig, write_config};
use crate::io::launcher::{ProcessResult, ProcessRunner};
use crate::io::modules::ModuleLoader;

/// Process runner that returns queued results and records every invocation.
pub struct RecordingRunner {
    results: Mutex<VecDeque<ProcessResult>>,
    calls: Mutex<Vec<(Invocation, Duration)>>,
}

impl RecordingRunner {
    pub fn new(results: Vec<ProcessResult>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Invocations received, in call order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(|(inv, _)| inv.clone()).collect())
            .unwrap_or_default()
    }

    pub fn steps(&self) -> Vec<StepKind> {
        self.invocations().iter().map(|inv| inv.step).collect()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(|(_, t)| *t).collect())
            .unwrap_or_default()
    }
}

impl ProcessRunner for RecordingRunner {
    fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ProcessResult> {
        self.calls
            .lock()
            .map_err(|_| anyhow!("calls lock poisoned"))?
            .push((invocation.clone(), timeout));
        self.results
            .lock()
            .map_err(|_| anyhow!("results lock poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted result for {}", invocation.step.as_str()))
    }
}

/// Module loader that adds fixed variables instead of running a shell.
pub struct StaticModuleLoader {
    pub vars: EnvMap,
}

impl StaticModuleLoader {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self {
            vars: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn load(&self, base: &EnvMap, modules: &[String]) -> Result<EnvMap> {
        let mut out = base.clone();
        if !modules.is_empty() {
            out.extend(self.vars.clone());
            out.insert("LOADEDMODULES".to_string(), modules.join(":"));
        }
        Ok(out)
    }
}

/// Scratch submission directory with a venv layout, both entry points and a config.
pub struct TestWorkdir {
    dir: TempDir,
}

impl TestWorkdir {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        fs::create_dir_all(dir.path().join("venv").join("bin")).context("create venv")?;
        fs::write(dir.path().join("ddp_mnist.py"), "# ddp entry point\n")
            .context("write ddp entry")?;
        fs::write(dir.path().join("dp_mnist.py"), "# dp entry point\n")
            .context("write dp entry")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("sequencer.toml")
    }

    /// Write `cfg` to `sequencer.toml` in the workdir.
    pub fn write_config(&self, cfg: &JobConfig) -> Result<PathBuf> {
        let path = self.config_path();
        write_config(&path, cfg)?;
        Ok(path)
    }
}

/// Default config with no modules and the given commands in place of the
/// launcher and interpreter, for running without a GPU stack.
pub fn local_config(launcher: &[&str], interpreter: &str) -> JobConfig {
    let mut cfg = JobConfig::default();
    cfg.environment.modules = Vec::new();
    cfg.distributed.launcher = launcher.iter().map(|s| s.to_string()).collect();
    cfg.single.interpreter = interpreter.to_string();
    cfg
}
