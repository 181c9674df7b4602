//! Deterministic construction of the job's process invocations.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::environment::EnvMap;
use crate::core::types::StepKind;
use crate::io::config::JobConfig;

/// One top-level process the sequencer spawns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub step: StepKind,
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    /// Complete child environment; the parent environment is not inherited.
    pub env: EnvMap,
}

impl Invocation {
    /// Shell-quoted command line, for logs and the run record.
    pub fn command_line(&self) -> String {
        shell_join(std::iter::once(&self.program).chain(&self.args))
    }
}

/// Join words into a shell command line, quoting only words that need it.
pub fn shell_join<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .enumerate()
        .map(|(i, word)| {
            let word = word.as_ref();
            // `NAME=value` in command position is an assignment, not a program.
            if i == 0 && word.contains('=') {
                shell_words::quote(word).into_owned()
            } else {
                quote_word(word).into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `word` unchanged when the shell reads it literally, else quoted.
pub fn quote_word(word: &str) -> Cow<'_, str> {
    let plain = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=,+@%".contains(&b));
    if plain {
        Cow::Borrowed(word)
    } else {
        shell_words::quote(word)
    }
}

/// Ordered invocations for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobPlan {
    pub workdir: PathBuf,
    pub steps: Vec<Invocation>,
}

/// Build the plan: the distributed launcher step, then the single-process step.
///
/// Pure: identical inputs always produce an identical plan.
pub fn build_plan(cfg: &JobConfig, workdir: &Path, env: &EnvMap) -> JobPlan {
    let steps = vec![ddp_invocation(cfg, workdir, env), dp_invocation(cfg, workdir, env)];
    JobPlan {
        workdir: workdir.to_path_buf(),
        steps,
    }
}

/// Launcher arguments after the launcher command itself.
pub fn launcher_args(cfg: &JobConfig) -> Vec<String> {
    let dist = &cfg.distributed;
    vec![
        format!("--nnodes={}", dist.nnodes),
        format!("--nproc_per_node={}", dist.nproc_per_node),
        format!("--master_port={}", dist.master_port),
        dist.entry_point.display().to_string(),
    ]
}

fn ddp_invocation(cfg: &JobConfig, workdir: &Path, env: &EnvMap) -> Invocation {
    // Launcher is validated non-empty; an empty one still yields a spawnable
    // (and failing) invocation rather than a panic.
    let (program, prefix) = match cfg.distributed.launcher.split_first() {
        Some((program, rest)) => (program.clone(), rest.to_vec()),
        None => (String::new(), Vec::new()),
    };
    let mut args = prefix;
    args.extend(launcher_args(cfg));
    Invocation {
        step: StepKind::Ddp,
        program,
        args,
        workdir: workdir.to_path_buf(),
        env: env.clone(),
    }
}

fn dp_invocation(cfg: &JobConfig, workdir: &Path, env: &EnvMap) -> Invocation {
    Invocation {
        step: StepKind::Dp,
        program: cfg.single.interpreter.clone(),
        args: vec![cfg.single.entry_point.display().to_string()],
        workdir: workdir.to_path_buf(),
        env: env.clone(),
    }
}
