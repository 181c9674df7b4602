//! Environment-module loading into an explicit child environment.
//!
//! `module load` is a shell function that edits the calling shell's
//! environment, so it cannot be run as a plain child process. The shell
//! loader evaluates it in a throwaway login shell and reads back the result
//! with `env -0`.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument};

use crate::core::environment::{EnvMap, diff, parse_env_dump};
use crate::io::process::run_command_with_timeout;

pub const MODULE_LOAD_TIMEOUT: Duration = Duration::from_secs(120);
const MODULE_OUTPUT_LIMIT_BYTES: usize = 4_000_000;

/// Produces the environment that results from loading `modules` on top of `base`.
pub trait ModuleLoader {
    fn load(&self, base: &EnvMap, modules: &[String]) -> Result<EnvMap>;
}

/// Loader that runs `module load` inside the configured shell.
#[derive(Debug, Clone)]
pub struct ShellModuleLoader {
    /// Shell prefix; the script is appended as the last argument (e.g. `["bash","-lc"]`).
    pub shell: Vec<String>,
    pub timeout: Duration,
}

impl ShellModuleLoader {
    pub fn new(shell: Vec<String>) -> Self {
        Self {
            shell,
            timeout: MODULE_LOAD_TIMEOUT,
        }
    }
}

/// Shell script that loads `modules` and dumps the resulting environment.
///
/// Module chatter goes to stderr so stdout carries only the dump.
pub fn module_load_script(modules: &[String]) -> String {
    format!("module load {} 1>&2 && env -0", shell_words::join(modules))
}

impl ModuleLoader for ShellModuleLoader {
    #[instrument(skip_all, fields(modules = ?modules))]
    fn load(&self, base: &EnvMap, modules: &[String]) -> Result<EnvMap> {
        if modules.is_empty() {
            debug!("no modules configured");
            return Ok(base.clone());
        }
        let (program, prefix) = self
            .shell
            .split_first()
            .ok_or_else(|| anyhow!("environment.shell must be a non-empty array"))?;

        let mut cmd = Command::new(program);
        cmd.args(prefix)
            .arg(module_load_script(modules))
            .env_clear()
            .envs(base);

        let output = run_command_with_timeout(cmd, None, self.timeout, MODULE_OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("run {program} for module load"))?;
        if output.timed_out {
            bail!("module load timed out after {:?}", self.timeout);
        }
        if !output.status.success() {
            bail!(
                "module load {} failed with exit code {}: {}",
                modules.join(" "),
                output.exit_code(),
                output.stderr_lossy()
            );
        }
        if output.stdout_truncated > 0 {
            bail!("environment dump exceeded {MODULE_OUTPUT_LIMIT_BYTES} bytes");
        }

        let loaded = parse_env_dump(&output.stdout);
        let changes = diff(base, &loaded);
        info!(
            added = changes.added.len(),
            changed = changes.changed.len(),
            removed = changes.removed.len(),
            "modules loaded"
        );
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_quotes_module_names() {
        let script = module_load_script(&["gcc/11.2".to_string(), "cuda".to_string()]);
        assert_eq!(script, "module load gcc/11.2 cuda 1>&2 && env -0");
    }

    #[test]
    fn no_modules_returns_base_unchanged() {
        let loader = ShellModuleLoader::new(vec!["/nonexistent-shell".to_string()]);
        let mut base = EnvMap::new();
        base.insert("A".to_string(), "1".to_string());
        let loaded = loader.load(&base, &[]).expect("load");
        assert_eq!(loaded, base);
    }

    #[cfg(unix)]
    #[test]
    fn shell_loader_reads_back_environment() {
        // A stand-in `module` function keeps the test independent of Lmod.
        // `sh -c <cmd> <script>` runs <cmd> with $0 set to the script text.
        let loader = ShellModuleLoader::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "module() { export LOADED_MODULES=\"$2\"; echo loading \"$2\"; }; eval \"$0\""
                .to_string(),
        ]);
        let mut base = EnvMap::new();
        base.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        base.insert("ENV_MARK".to_string(), "kept".to_string());

        let loaded = loader.load(&base, &["cuda".to_string()]).expect("load");
        assert_eq!(loaded.get("LOADED_MODULES").map(String::as_str), Some("cuda"));
        assert_eq!(loaded.get("ENV_MARK").map(String::as_str), Some("kept"));
    }

    #[cfg(unix)]
    #[test]
    fn failing_module_load_is_an_error() {
        let loader = ShellModuleLoader::new(vec!["sh".to_string(), "-c".to_string()]);
        let mut base = EnvMap::new();
        base.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        // Plain `sh` has no `module` function, so the load fails.
        let err = loader
            .load(&base, &["cuda".to_string()])
            .expect_err("module load should fail");
        assert!(format!("{err:#}").contains("module load cuda failed"));
    }
}
