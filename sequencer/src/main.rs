//! Batch job sequencer CLI.
//!
//! Reads `sequencer.toml`, renders the scheduler job script, and on the
//! compute node runs the distributed launcher step followed by the
//! single-process step with an explicitly resolved environment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

use sequencer::core::environment::capture_process_env;
use sequencer::core::types::FailurePolicy;
use sequencer::exit_codes;
use sequencer::io::config::{
    DEFAULT_CONFIG_PATH, JobConfig, load_config, read_config, write_config,
};
use sequencer::io::launcher::SystemProcessRunner;
use sequencer::io::modules::ShellModuleLoader;
use sequencer::io::run_log::run_id_from_env;
use sequencer::io::script::{ScriptMode, render_script};
use sequencer::io::submit::{DEFAULT_SUBMIT_TIMEOUT, SubmitRequest, submit_script};
use sequencer::job::{JobRun, prepare_job, resolve_workdir, run_job, run_paths};
use sequencer::logging;

#[derive(Parser)]
#[command(
    name = "sequencer",
    version,
    about = "Batch job sequencer for distributed and single-process training runs"
)]
struct Cli {
    /// Job configuration file (defaults apply when it does not exist).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Check the configuration against resource and launch invariants.
    Check,
    /// Print the job script.
    Render {
        #[arg(long, value_enum, default_value_t = Mode::Shell)]
        mode: Mode,
    },
    /// Print the resolved invocations as JSON without running them.
    Plan {
        /// Working directory (defaults to the submission directory variable).
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
    /// Run both training steps in order.
    Run {
        /// Working directory (defaults to the submission directory variable).
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Skip the single-process step when the distributed step fails.
        #[arg(long)]
        stop_on_failure: bool,
    },
    /// Submit the job script to the batch scheduler.
    Submit {
        #[arg(long, value_enum, default_value_t = Mode::Sequencer)]
        mode: Mode,
        /// Print the script instead of submitting it.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Standalone bash script.
    Shell,
    /// Script that calls `sequencer run` on the compute node.
    Sequencer,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = cli.config.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(config, force),
        Command::Check => cmd_check(config),
        Command::Render { mode } => cmd_render(config, mode),
        Command::Plan { workdir } => cmd_plan(config, workdir.as_deref()),
        Command::Run {
            workdir,
            stop_on_failure,
        } => cmd_run(config, workdir.as_deref(), stop_on_failure),
        Command::Submit { mode, dry_run } => cmd_submit(config, mode, dry_run),
    }
}

fn cmd_init(config: &Path, force: bool) -> Result<i32> {
    if config.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", config.display());
    }
    write_config(config, &JobConfig::default())?;
    println!("wrote {}", config.display());
    Ok(exit_codes::OK)
}

fn cmd_check(config: &Path) -> Result<i32> {
    let cfg = read_config(config)?;
    cfg.validate()?;
    println!("ok: {}", config.display());
    Ok(exit_codes::OK)
}

fn cmd_render(config: &Path, mode: Mode) -> Result<i32> {
    let cfg = load_config(config)?;
    print!("{}", render_script(&cfg, &script_mode(config, mode)?)?);
    Ok(exit_codes::OK)
}

fn cmd_plan(config: &Path, workdir: Option<&Path>) -> Result<i32> {
    let cfg = load_config(config)?;
    let base_env = capture_process_env();
    let workdir = resolve_workdir(&cfg, &base_env, workdir)?;
    let loader = ShellModuleLoader::new(cfg.environment.shell.clone());
    let prepared = prepare_job(&cfg, &base_env, &workdir, &loader)?;
    let mut out = serde_json::to_string_pretty(&prepared.plan).context("serialize plan")?;
    out.push('\n');
    print!("{out}");
    Ok(exit_codes::OK)
}

fn cmd_run(config: &Path, workdir: Option<&Path>, stop_on_failure: bool) -> Result<i32> {
    let cfg = load_config(config)?;
    let base_env = capture_process_env();
    let workdir = resolve_workdir(&cfg, &base_env, workdir)?;
    let policy = if stop_on_failure {
        FailurePolicy::StopOnFailure
    } else {
        cfg.policy.failure_policy()
    };
    let run_id = run_id_from_env(&base_env);
    debug!(run_id = %run_id, ?policy, "run requested");

    let runner = SystemProcessRunner {
        log_dir: Some(run_paths(&cfg, &workdir, &run_id).dir),
        output_limit_bytes: cfg.policy.output_limit_bytes,
        echo: true,
    };
    let loader = ShellModuleLoader::new(cfg.environment.shell.clone());
    let job = JobRun {
        cfg: &cfg,
        base_env: &base_env,
        workdir: &workdir,
        policy,
        run_id,
    };
    let record = run_job(&job, &loader, &runner)?;

    for step in &record.outcome.steps {
        let code = step
            .exit_code
            .map_or_else(|| "-".to_string(), |c| c.to_string());
        println!(
            "step: {} status={:?} exit={} duration_ms={}",
            step.step.as_str(),
            step.status,
            code,
            step.duration_ms
        );
    }
    println!(
        "run: id={} exit={}",
        record.run_id, record.outcome.exit_code
    );
    Ok(record.outcome.exit_code)
}

fn cmd_submit(config: &Path, mode: Mode, dry_run: bool) -> Result<i32> {
    let cfg = load_config(config)?;
    if mode == Mode::Sequencer && !config.exists() {
        bail!(
            "{} not found; the compute node needs it (run `sequencer init`)",
            config.display()
        );
    }
    let script = render_script(&cfg, &script_mode(config, mode)?)?;
    if dry_run {
        print!("{script}");
        return Ok(exit_codes::OK);
    }
    let request = SubmitRequest {
        command: cfg.submit.command.clone(),
        workdir: std::env::current_dir().context("read current directory")?,
        timeout: DEFAULT_SUBMIT_TIMEOUT,
    };
    let job_id = submit_script(&request, &script)?;
    println!("{job_id}");
    Ok(exit_codes::OK)
}

fn script_mode(config: &Path, mode: Mode) -> Result<ScriptMode> {
    match mode {
        Mode::Shell => Ok(ScriptMode::Shell),
        Mode::Sequencer => {
            let binary = std::env::current_exe().context("locate sequencer binary")?;
            // Absolute so the script works from any directory on the compute node.
            let config = config.canonicalize().unwrap_or_else(|_| config.to_path_buf());
            Ok(ScriptMode::Sequencer {
                binary: binary.display().to_string(),
                config,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_defaults() {
        let cli = Cli::parse_from(["sequencer", "run"]);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(matches!(
            cli.command,
            Command::Run {
                workdir: None,
                stop_on_failure: false
            }
        ));
    }

    #[test]
    fn parse_global_config_after_subcommand() {
        let cli = Cli::parse_from(["sequencer", "check", "--config", "job.toml"]);
        assert_eq!(cli.config, PathBuf::from("job.toml"));
        assert!(matches!(cli.command, Command::Check));
    }

    #[test]
    fn parse_submit_modes() {
        let cli = Cli::parse_from(["sequencer", "submit", "--dry-run"]);
        assert!(matches!(
            cli.command,
            Command::Submit {
                mode: Mode::Sequencer,
                dry_run: true
            }
        ));
        let cli = Cli::parse_from(["sequencer", "render", "--mode", "sequencer"]);
        assert!(matches!(
            cli.command,
            Command::Render {
                mode: Mode::Sequencer
            }
        ));
    }
}
