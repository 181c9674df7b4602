//! `#PBS` directive lines for the job script header.

use crate::core::resources::mail_flags;
use crate::io::config::JobConfig;

/// Render directive lines in a fixed order: walltime, select, name, mail
/// events, then account and email when configured.
pub fn render_directives(cfg: &JobConfig) -> Vec<String> {
    let mut lines = vec![
        format!("#PBS -l walltime={}", cfg.resources.walltime),
        format!("#PBS -l {}", cfg.resources.select_spec()),
        format!("#PBS -N {}", cfg.job.name),
        format!("#PBS -m {}", mail_flags(&cfg.job.mail_events)),
    ];
    if !cfg.job.account.is_empty() {
        lines.push(format!("#PBS -A {}", cfg.job.account));
    }
    if !cfg.job.email.is_empty() {
        lines.push(format!("#PBS -M {}", cfg.job.email));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives() {
        let lines = render_directives(&JobConfig::default());
        assert_eq!(
            lines,
            vec![
                "#PBS -l walltime=00:10:00",
                "#PBS -l select=1:ncpus=8:ngpus=4:mem=32gb:gpu_mem=32gb",
                "#PBS -N ddp_mnist",
                "#PBS -m abe",
            ]
        );
    }

    #[test]
    fn account_and_email_follow_mail_flags() {
        let mut cfg = JobConfig::default();
        cfg.job.account = "gpu-lab".to_string();
        cfg.job.email = "someone@example.org".to_string();
        let lines = render_directives(&cfg);
        assert_eq!(lines[4], "#PBS -A gpu-lab");
        assert_eq!(lines[5], "#PBS -M someone@example.org");
    }
}
