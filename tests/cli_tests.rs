#![cfg(feature = "cli")]

use assert_cmd::Command;
use predicates::str::contains as str_contains;
use tempfile::TempDir;

#[allow(deprecated)]
fn run_cli(db: &TempDir, script: &str) -> assert_cmd::assert::Assert {
    let mut cmd = Command::cargo_bin("cli").expect("cli binary");
    cmd.arg(db.path().join("tasks.db"))
        .env_remove("STUDY_SCHEDULER_LOG")
        .write_stdin(script.to_string())
        .assert()
}

#[test]
fn cli_adds_and_shows_tasks() {
    let db = tempfile::tempdir().unwrap();
    run_cli(&db, "add 1 2025-03-03 Maths Long division\nshow 1 2025-03-03\nquit\n")
        .success()
        .stdout(str_contains("Task 1 added."))
        .stdout(str_contains("Long division"));
}

#[test]
fn cli_close_defers_across_rest_day() {
    let db = tempfile::tempdir().unwrap();
    let script = "add 1 2025-03-03 Maths A\n\
                  add 1 2025-03-03 Maths B\n\
                  add 1 2025-03-03 Maths C\n\
                  rest 1 2025-03-04\n\
                  close 1 2025-03-03\n\
                  close 1 2025-03-03\n\
                  quit\n";
    run_cli(&db, script)
        .success()
        .stdout(str_contains("action=defer, moved=3, to=2025-03-05"))
        .stdout(str_contains("reason=AlreadyProcessed"));
}

#[test]
fn cli_state_survives_restart() {
    let db = tempfile::tempdir().unwrap();
    run_cli(&db, "add 1 2025-03-03 History Timeline\nquit\n").success();

    run_cli(&db, "closeall 2025-03-03\nshow 1 2025-03-04\nquit\n")
        .success()
        .stdout(str_contains("Batch finished (date=2025-03-03, students=1, moved=1"))
        .stdout(str_contains("carried_over"));
}

#[test]
fn cli_rejects_work_on_rest_day() {
    let db = tempfile::tempdir().unwrap();
    run_cli(&db, "rest 2 2025-03-08\nadd 2 2025-03-08 Art Sketch\nquit\n")
        .success()
        .stdout(str_contains("Error: invalid data"));
}

#[test]
fn cli_policy_and_audit_commands() {
    let db = tempfile::tempdir().unwrap();
    let script = "policy set 3 4 2 5\n\
                  policy show 3\n\
                  add 3 2025-03-03 Music Scales\n\
                  add 3 2025-03-03 Music Arpeggios\n\
                  close 3 2025-03-03\n\
                  remove 1 duplicate\n\
                  audit 3\n\
                  quit\n";
    run_cli(&db, script)
        .success()
        .stdout(str_contains("Policy updated for student 3."))
        .stdout(str_contains("threshold=2"))
        .stdout(str_contains("action=defer"))
        .stdout(str_contains("Removed task 1 from 2025-03-04."))
        .stdout(str_contains("midnight_process"))
        .stdout(str_contains("delete"));
}

#[test]
fn cli_unknown_command_hint() {
    let db = tempfile::tempdir().unwrap();
    run_cli(&db, "frobnicate\nquit\n")
        .success()
        .stdout(str_contains("Unknown command 'frobnicate'. Type 'help'."));
}
