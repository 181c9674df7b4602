//! CLI tests for `sequencer init`, `check`, `render` and `plan`.
//!
//! Spawns the sequencer binary and verifies exit codes and stdout.

use std::fs;
use std::process::{Command, Output};

use sequencer::exit_codes;
use sequencer::test_support::{TestWorkdir, local_config};

fn sequencer(workdir: &TestWorkdir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sequencer"))
        .current_dir(workdir.path())
        .args(args)
        .env_remove("PBS_O_WORKDIR")
        .env_remove("PBS_JOBID")
        .output()
        .expect("run sequencer")
}

#[test]
fn init_writes_default_config_once() {
    let workdir = TestWorkdir::new().expect("workdir");

    let first = sequencer(&workdir, &["init"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    let contents = fs::read_to_string(workdir.config_path()).expect("read config");
    assert!(contents.contains("master_port = 29400"));
    assert!(contents.contains("walltime = \"00:10:00\""));

    let second = sequencer(&workdir, &["init"]);
    assert_eq!(second.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&second.stderr).contains("--force"));

    let forced = sequencer(&workdir, &["init", "--force"]);
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
}

#[test]
fn check_rejects_gpu_worker_mismatch() {
    let workdir = TestWorkdir::new().expect("workdir");
    fs::write(
        workdir.config_path(),
        "[resources]\nngpus = 2\n\n[distributed]\nmaster_port = 80\n",
    )
    .expect("write config");

    let out = sequencer(&workdir, &["check"]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("nproc_per_node (4) must equal resources.ngpus (2)"));
    assert!(stderr.contains("master_port 80"));
}

#[test]
fn check_accepts_defaults() {
    let workdir = TestWorkdir::new().expect("workdir");
    let out = sequencer(&workdir, &["check"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
}

#[test]
fn render_prints_directives_and_commands() {
    let workdir = TestWorkdir::new().expect("workdir");
    let out = sequencer(&workdir, &["render"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let script = String::from_utf8_lossy(&out.stdout);
    assert!(script.contains("#PBS -l walltime=00:10:00\n"));
    assert!(script.contains("#PBS -l select=1:ncpus=8:ngpus=4:mem=32gb:gpu_mem=32gb\n"));
    assert!(script.contains("#PBS -m abe\n"));
    assert!(script.contains("module load nccl\n"));
    assert!(script.find("torchrun") < script.find("python dp_mnist.py"));
}

#[test]
fn submit_dry_run_hands_off_to_run() {
    let workdir = TestWorkdir::new().expect("workdir");
    workdir
        .write_config(&local_config(&["true"], "true"))
        .expect("write config");
    let out = sequencer(&workdir, &["submit", "--dry-run"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let script = String::from_utf8_lossy(&out.stdout);
    assert!(script.contains("#PBS -N ddp_mnist\n"));
    assert!(script.contains(" run --config "));
    assert!(!script.contains("module load"));
}

#[test]
fn plan_is_identical_across_invocations() {
    let workdir = TestWorkdir::new().expect("workdir");
    workdir
        .write_config(&local_config(&["torchrun"], "python"))
        .expect("write config");
    let dir = workdir.path().display().to_string();

    let first = sequencer(&workdir, &["plan", "--workdir", &dir]);
    let second = sequencer(&workdir, &["plan", "--workdir", &dir]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    assert_eq!(first.stdout, second.stdout);

    let plan: serde_json::Value = serde_json::from_slice(&first.stdout).expect("plan json");
    let steps = plan["steps"].as_array().expect("steps");
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0]["step"], "ddp");
    assert_eq!(steps[0]["args"][1], "--nproc_per_node=4");
    assert_eq!(steps[0]["args"][2], "--master_port=29400");
    assert_eq!(steps[1]["step"], "dp");
    assert_eq!(steps[1]["args"][0], "dp_mnist.py");
    assert!(
        steps[1]["env"]["VIRTUAL_ENV"]
            .as_str()
            .is_some_and(|v| v.ends_with("venv"))
    );
}
