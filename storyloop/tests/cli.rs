//! CLI tests for the `storyloop` binary.
//!
//! Spawns the binary and verifies exit codes and the event channel for
//! startup errors, selection, and runs that never reach a real agent.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use storyloop::core::events::RunEvent;
use storyloop::exit_codes;
use storyloop::test_support::{parse_events, prd, story, write_prd};

const CREDENTIAL_VARS: [&str; 2] = ["ANTHROPIC_API_KEY", "CLAUDE_CODE_OAUTH_TOKEN"];

fn storyloop(project: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_storyloop"));
    cmd.current_dir(project).env("RUST_LOG", "storyloop=debug");
    for var in CREDENTIAL_VARS {
        cmd.env_remove(var);
    }
    cmd
}

fn run_args(project: &Path, prd_path: &Path) -> Vec<String> {
    vec![
        "run".to_string(),
        "--project-dir".to_string(),
        project.display().to_string(),
        "--prd".to_string(),
        prd_path.display().to_string(),
        "--run-id".to_string(),
        "cli-run".to_string(),
        "--max-iterations".to_string(),
        "2".to_string(),
    ]
}

fn output(cmd: &mut Command) -> Output {
    cmd.output().expect("spawn storyloop")
}

#[test]
fn missing_credential_is_invalid_and_silent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_prd(temp.path(), &prd(vec![story("S-1", 1, false)])).expect("write");

    let out = output(storyloop(temp.path()).args(run_args(temp.path(), &path)));

    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(out.stdout.is_empty());
    assert!(String::from_utf8_lossy(&out.stderr).contains("ANTHROPIC_API_KEY"));
}

#[test]
fn missing_arguments_are_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = output(storyloop(temp.path()).args(["run", "--run-id", "x"]));

    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(out.stdout.is_empty());
}

#[test]
fn missing_document_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("prd.json");

    let out = output(
        storyloop(temp.path())
            .env("ANTHROPIC_API_KEY", "test-key")
            .args(run_args(temp.path(), &path)),
    );

    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(out.stdout.is_empty());
}

#[test]
fn malformed_document_emits_single_run_failed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("prd.json");
    fs::write(&path, "{ not json").expect("write");

    let out = output(
        storyloop(temp.path())
            .env("ANTHROPIC_API_KEY", "test-key")
            .args(run_args(temp.path(), &path)),
    );

    assert_eq!(out.status.code(), Some(exit_codes::RUN_FAILED));
    let events = parse_events(&out.stdout);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        RunEvent::RunFailed { run_id, .. } if run_id == "cli-run"
    ));
}

/// The configured agent cannot be spawned: every iteration fails, the run
/// still completes, and events are appended to the output file.
#[test]
fn unspawnable_agent_fails_iterations_but_completes_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_prd(temp.path(), &prd(vec![story("S-1", 1, false)])).expect("write");
    fs::write(
        temp.path().join(".storyloop.toml"),
        "[agent]\ncommand = \"/nonexistent/storyloop-agent\"\n",
    )
    .expect("write config");
    let events_path = temp.path().join("events.jsonl");
    fs::write(&events_path, "").expect("create events file");

    let out = output(
        storyloop(temp.path())
            .env("CLAUDE_CODE_OAUTH_TOKEN", "test-token")
            .args(run_args(temp.path(), &path))
            .arg("--output")
            .arg(&events_path),
    );

    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(out.stdout.is_empty());
    let events = parse_events(&fs::read(&events_path).expect("read events"));
    let kinds: Vec<&str> = events.iter().map(RunEvent::kind).collect();
    assert_eq!(
        kinds,
        vec![
            "run_started",
            "iteration_started",
            "iteration_failed",
            "iteration_started",
            "iteration_failed",
            "run_completed",
        ]
    );
    let RunEvent::IterationFailed { error, .. } = &events[2] else {
        panic!("expected iteration_failed");
    };
    assert!(error.contains("/nonexistent/storyloop-agent"), "{error}");
}

#[test]
fn select_prints_next_story_id() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_prd(
        temp.path(),
        &prd(vec![story("S-1", 1, false), story("S-2", 9, false)]),
    )
    .expect("write");

    let out = output(storyloop(temp.path()).arg("select").arg("--prd").arg(&path));

    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "S-2");
}

#[test]
fn select_complete_exits_with_complete_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_prd(temp.path(), &prd(vec![story("S-1", 1, true)])).expect("write");

    let status = storyloop(temp.path())
        .arg("select")
        .arg("--prd")
        .arg(&path)
        .status()
        .expect("storyloop select");

    assert_eq!(status.code(), Some(exit_codes::COMPLETE));
}

#[test]
fn status_reports_progress() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_prd(
        temp.path(),
        &prd(vec![story("S-1", 1, true), story("S-2", 1, false)]),
    )
    .expect("write");

    let out = output(storyloop(temp.path()).arg("status").arg("--prd").arg(&path));

    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("progress: 1/2 stories pass"), "{stdout}");
    assert!(stdout.contains("next: S-2"), "{stdout}");
}
