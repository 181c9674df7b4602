//! Child-process environment as an explicit value.
//!
//! The sequencer never mutates its own environment. Module loads and venv
//! activation produce a new [`EnvMap`] that is handed to each spawn.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Ordered `KEY -> VALUE` environment for a child process.
pub type EnvMap = BTreeMap<String, String>;

/// Capture the current process environment. Non-UTF-8 entries are dropped.
pub fn capture_process_env() -> EnvMap {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

/// Parse `env -0` output (NUL-separated `KEY=VALUE` records).
///
/// Records without `=` or with an empty key are skipped; values may contain
/// `=` and newlines.
pub fn parse_env_dump(raw: &[u8]) -> EnvMap {
    raw.split(|b| *b == 0)
        .filter(|record| !record.is_empty())
        .filter_map(|record| {
            let text = String::from_utf8_lossy(record);
            let (key, value) = text.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Apply virtual environment activation to `env`.
///
/// Mirrors the effect of `source <venv>/bin/activate`: sets `VIRTUAL_ENV`,
/// prepends `<venv>/bin` to `PATH` and drops `PYTHONHOME`.
pub fn activate_venv(env: &EnvMap, venv_dir: &Path) -> EnvMap {
    let mut out = env.clone();
    let bin = venv_dir.join("bin");
    let path = match env.get("PATH").filter(|p| !p.is_empty()) {
        Some(existing) => format!("{}:{existing}", bin.display()),
        None => bin.display().to_string(),
    };
    out.insert("VIRTUAL_ENV".to_string(), venv_dir.display().to_string());
    out.insert("PATH".to_string(), path);
    out.remove("PYTHONHOME");
    out
}

/// Difference between two environments, keyed for stable output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvDiff {
    pub added: BTreeMap<String, String>,
    pub changed: BTreeMap<String, String>,
    pub removed: Vec<String>,
}

impl EnvDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

pub fn diff(before: &EnvMap, after: &EnvMap) -> EnvDiff {
    let mut out = EnvDiff::default();
    for (key, value) in after {
        match before.get(key) {
            None => {
                out.added.insert(key.clone(), value.clone());
            }
            Some(old) if old != value => {
                out.changed.insert(key.clone(), value.clone());
            }
            Some(_) => {}
        }
    }
    out.removed = before
        .keys()
        .filter(|key| !after.contains_key(*key))
        .cloned()
        .collect();
    out
}

/// Resolve `program` against the `PATH` of `env`.
///
/// Programs containing a path separator are returned as-is (joined onto
/// `workdir` when relative). Returns `None` when no executable match exists.
pub fn resolve_program(program: &str, env: &EnvMap, workdir: &Path) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        let full = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            workdir.join(candidate)
        };
        return is_executable(&full).then_some(full);
    }
    let path_var = env.get("PATH")?;
    std::env::split_paths(OsStr::new(path_var))
        .map(|dir| {
            if dir.is_relative() {
                workdir.join(dir).join(program)
            } else {
                dir.join(program)
            }
        })
        .find(|full| is_executable(full))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parse_env_dump_handles_multiline_values() {
        let raw = b"PATH=/usr/bin\0FUNC=() {  echo hi\n}\0EQ=a=b\0=broken\0noequals\0";
        let parsed = parse_env_dump(raw);
        assert_eq!(parsed.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(
            parsed.get("FUNC").map(String::as_str),
            Some("() {  echo hi\n}")
        );
        assert_eq!(parsed.get("EQ").map(String::as_str), Some("a=b"));
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn activate_venv_prepends_bin_and_drops_pythonhome() {
        let base = env(&[("PATH", "/usr/bin:/bin"), ("PYTHONHOME", "/opt/py")]);
        let activated = activate_venv(&base, Path::new("/work/venv"));
        assert_eq!(
            activated.get("PATH").map(String::as_str),
            Some("/work/venv/bin:/usr/bin:/bin")
        );
        assert_eq!(
            activated.get("VIRTUAL_ENV").map(String::as_str),
            Some("/work/venv")
        );
        assert!(!activated.contains_key("PYTHONHOME"));
        // Base map is untouched.
        assert_eq!(base.get("PATH").map(String::as_str), Some("/usr/bin:/bin"));
    }

    #[test]
    fn activate_venv_without_path() {
        let activated = activate_venv(&EnvMap::new(), Path::new("/v"));
        assert_eq!(activated.get("PATH").map(String::as_str), Some("/v/bin"));
    }

    #[test]
    fn diff_reports_added_changed_removed() {
        let before = env(&[("A", "1"), ("B", "2"), ("C", "3")]);
        let after = env(&[("A", "1"), ("B", "20"), ("D", "4")]);
        let d = diff(&before, &after);
        assert_eq!(d.added, env(&[("D", "4")]));
        assert_eq!(d.changed, env(&[("B", "20")]));
        assert_eq!(d.removed, vec!["C".to_string()]);
        assert!(diff(&before, &before).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn resolve_program_uses_child_path() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let bin = temp.path().join("venv/bin");
        std::fs::create_dir_all(&bin).expect("mkdir");
        let python = bin.join("python");
        std::fs::write(&python, "#!/bin/sh\n").expect("write");
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let bin_path = bin.display().to_string();
        let child = env(&[("PATH", bin_path.as_str())]);
        assert_eq!(
            resolve_program("python", &child, temp.path()),
            Some(python.clone())
        );
        assert_eq!(resolve_program("python", &EnvMap::new(), temp.path()), None);
        assert_eq!(
            resolve_program("venv/bin/python", &EnvMap::new(), temp.path()),
            Some(python)
        );
    }
}
