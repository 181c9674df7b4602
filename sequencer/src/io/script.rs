//! Job script rendering for batch submission.

use std::path::PathBuf;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::directives::render_directives;
use crate::core::plan::{launcher_args, quote_word, shell_join};
use crate::core::types::FailurePolicy;
use crate::io::config::JobConfig;

const JOB_TEMPLATE: &str = include_str!("../templates/job.pbs");

/// What the script body does after the directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptMode {
    /// Standalone bash: module loads, venv activation and both training commands.
    Shell,
    /// Hand the job to `sequencer run` on the compute node.
    Sequencer {
        /// Path or name of the sequencer binary on the compute node.
        binary: String,
        config: PathBuf,
    },
}

fn engine() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("job.pbs", JOB_TEMPLATE)
        .context("load job script template")?;
    Ok(env)
}

/// Render the job script: directives followed by the body for `mode`.
///
/// Every interpolated value is shell-quoted.
pub fn render_script(cfg: &JobConfig, mode: &ScriptMode) -> Result<String> {
    let env = engine()?;
    let template = env.get_template("job.pbs")?;

    let modules: Vec<String> = cfg
        .environment
        .modules
        .iter()
        .map(|m| quote_word(m).into_owned())
        .collect();
    let activate = cfg.environment.venv.join("bin").join("activate");
    let ddp_command = shell_join(
        cfg.distributed
            .launcher
            .iter()
            .cloned()
            .chain(launcher_args(cfg)),
    );
    let dp_command = shell_join([
        cfg.single.interpreter.clone(),
        cfg.single.entry_point.display().to_string(),
    ]);
    let sequencer_command = match mode {
        ScriptMode::Shell => String::new(),
        ScriptMode::Sequencer { binary, config } => shell_join([
            binary.clone(),
            "run".to_string(),
            "--config".to_string(),
            config.display().to_string(),
        ]),
    };

    let shell_mode = matches!(mode, ScriptMode::Shell);
    let stop_on_failure = cfg.policy.failure_policy() == FailurePolicy::StopOnFailure;

    let rendered = template
        .render(context! {
            directives => render_directives(cfg),
            shell_mode => shell_mode,
            stop_on_failure => stop_on_failure,
            modules => modules,
            workdir_var => cfg.environment.workdir_var,
            activate => quote_word(&activate.display().to_string()).into_owned(),
            ddp_command => ddp_command,
            dp_command => dp_command,
            sequencer_command => sequencer_command,
        })
        .context("render job script")?;
    debug!(bytes = rendered.len(), ?mode, "job script rendered");
    Ok(rendered)
}
