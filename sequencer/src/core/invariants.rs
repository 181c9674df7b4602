//! Consistency rules between the resource request and the launch commands.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::resources::Walltime;
use crate::io::config::JobConfig;

static JOB_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.+-]{0,235}$").expect("job name regex"));

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env var regex"));

pub const MIN_MASTER_PORT: u32 = 1024;
pub const MAX_MASTER_PORT: u32 = 65535;

/// Check configuration rules not expressible in the TOML types:
/// - one GPU per distributed worker, and matching node counts
/// - rendezvous port in the unprivileged range
/// - non-zero walltime and enough CPUs for every worker
/// - scheduler-safe job name, account and notification address
/// - submission directory variable usable as `$NAME` in the script
/// - non-empty commands, entry points and module names
pub fn validate_config(cfg: &JobConfig) -> Vec<String> {
    let mut errors = Vec::new();
    let res = &cfg.resources;
    let dist = &cfg.distributed;

    if dist.nproc_per_node != res.ngpus {
        errors.push(format!(
            "distributed.nproc_per_node ({}) must equal resources.ngpus ({})",
            dist.nproc_per_node, res.ngpus
        ));
    }
    if dist.nnodes != res.nodes {
        errors.push(format!(
            "distributed.nnodes ({}) must equal resources.nodes ({})",
            dist.nnodes, res.nodes
        ));
    }
    if !(MIN_MASTER_PORT..=MAX_MASTER_PORT).contains(&dist.master_port) {
        errors.push(format!(
            "distributed.master_port {} must be within {MIN_MASTER_PORT}..={MAX_MASTER_PORT}",
            dist.master_port
        ));
    }

    if res.walltime.is_zero() {
        errors.push("resources.walltime must be > 00:00:00".to_string());
    }
    if res.walltime > Walltime::MAX {
        errors.push(format!(
            "resources.walltime {} must be at most {}",
            res.walltime,
            Walltime::MAX
        ));
    }
    if res.nodes == 0 {
        errors.push("resources.nodes must be > 0".to_string());
    }
    if dist.nproc_per_node == 0 {
        errors.push("distributed.nproc_per_node must be > 0".to_string());
    }
    if res.ncpus < dist.nproc_per_node {
        errors.push(format!(
            "resources.ncpus ({}) must be >= distributed.nproc_per_node ({})",
            res.ncpus, dist.nproc_per_node
        ));
    }

    if !JOB_NAME_RE.is_match(&cfg.job.name) {
        errors.push(format!(
            "job.name '{}' must start with a letter and use [A-Za-z0-9_.+-] only",
            cfg.job.name
        ));
    }
    if !is_single_token(&cfg.job.account) {
        errors.push(format!(
            "job.account {:?} must not contain whitespace or control characters",
            cfg.job.account
        ));
    }
    let email = &cfg.job.email;
    if !email.is_empty() && (!is_single_token(email) || email.matches('@').count() != 1) {
        errors.push(format!("job.email {email:?} is not an address"));
    }
    if !ENV_VAR_RE.is_match(&cfg.environment.workdir_var) {
        errors.push(format!(
            "environment.workdir_var {:?} must be a shell variable name",
            cfg.environment.workdir_var
        ));
    }

    check_command(&mut errors, "distributed.launcher", &dist.launcher);
    check_command(&mut errors, "environment.shell", &cfg.environment.shell);
    check_command(&mut errors, "submit.command", &cfg.submit.command);
    if cfg.single.interpreter.trim().is_empty() {
        errors.push("single.interpreter must not be empty".to_string());
    }
    if dist.entry_point.as_os_str().is_empty() {
        errors.push("distributed.entry_point must not be empty".to_string());
    }
    if cfg.single.entry_point.as_os_str().is_empty() {
        errors.push("single.entry_point must not be empty".to_string());
    }
    for module in &cfg.environment.modules {
        if module.is_empty() || module.chars().any(char::is_whitespace) {
            errors.push(format!(
                "environment.modules entry '{module}' must be a single non-empty word"
            ));
        }
    }

    errors
}

/// Empty, or free of whitespace and control characters.
fn is_single_token(value: &str) -> bool {
    !value.chars().any(|c| c.is_whitespace() || c.is_control())
}

fn check_command(errors: &mut Vec<String>, label: &str, command: &[String]) {
    if command.first().is_none_or(|program| program.trim().is_empty()) {
        errors.push(format!("{label} must be a non-empty array"));
    }
}
