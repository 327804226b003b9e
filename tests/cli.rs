//! CLI surface tests: init, input validation, status/health reporting.

use assert_cmd::Command;
use predicates::prelude::*;

fn conductor(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("conductor").unwrap();
    cmd.arg("--project-root").arg(dir);
    cmd
}

#[test]
fn init_scaffolds_store_and_prompts() {
    let dir = tempfile::tempdir().unwrap();
    conductor(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized conductor"));

    assert!(dir.path().join(".conductor/pipeline.db").exists());
    assert!(dir.path().join(".conductor/prompts/dev-story.md").exists());
    assert!(dir.path().join(".conductor/logs").is_dir());

    // A second init verifies instead of clobbering.
    conductor(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("already initialized"));
}

#[test]
fn commands_require_init() {
    let dir = tempfile::tempdir().unwrap();
    conductor(dir.path())
        .arg("health")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("conductor init"));
}

#[test]
fn health_without_runs_reports_no_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    conductor(dir.path()).arg("init").assert().success();

    conductor(dir.path())
        .args(["health", "--output-format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"success\":true"))
        .stdout(predicate::str::contains("NO_PIPELINE_RUNNING"));
}

#[test]
fn run_from_analysis_requires_concept() {
    let dir = tempfile::tempdir().unwrap();
    conductor(dir.path()).arg("init").assert().success();

    conductor(dir.path())
        .args(["run", "--from", "analysis"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--concept"));
}

#[test]
fn run_rejects_invalid_phase_and_story_keys() {
    let dir = tempfile::tempdir().unwrap();
    conductor(dir.path()).arg("init").assert().success();

    conductor(dir.path())
        .args(["run", "--from", "deploy", "--concept", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid phase"));

    conductor(dir.path())
        .args([
            "run",
            "--from",
            "implementation",
            "--stories",
            "not a key",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Malformed story key"));
}

#[test]
fn run_rejects_stop_after_before_from() {
    let dir = tempfile::tempdir().unwrap();
    conductor(dir.path()).arg("init").assert().success();

    conductor(dir.path())
        .args([
            "run",
            "--from",
            "solutioning",
            "--stop-after",
            "planning",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nothing would run"));
}

#[test]
fn status_without_runs_is_a_handled_failure() {
    let dir = tempfile::tempdir().unwrap();
    conductor(dir.path()).arg("init").assert().success();

    conductor(dir.path())
        .arg("status")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("No pipeline run"));

    // In JSON mode the failure is a single JSON line on stdout.
    conductor(dir.path())
        .args(["status", "--output-format", "json"])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("\"success\":false"));
}

#[test]
fn amend_requires_a_completed_parent() {
    let dir = tempfile::tempdir().unwrap();
    conductor(dir.path()).arg("init").assert().success();

    conductor(dir.path())
        .args(["amend", "--concept", "tweak the thing"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("completed parent"));
}
