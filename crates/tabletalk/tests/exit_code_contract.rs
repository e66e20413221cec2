use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use serde_json::Value;

const EXIT_SUCCESS: i32 = 0;
const EXIT_RUNTIME_FAILURE: i32 = 1;
const EXIT_INPUT_FAILURE: i32 = 2;
const EXIT_USAGE_ERROR: i32 = 64;

const HR_DDL: &str = include_str!("../schemas/hr.sql");
const HR_SEED: &str = include_str!("fixtures/hr_seed.sql");

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}-{nanos}"))
}

/// Home dir whose default data dir holds a seeded `hr` platform.
fn seeded_home(prefix: &str) -> PathBuf {
    let home = unique_temp_dir(prefix);
    let data_dir = home.join(".tabletalk").join("data");
    std::fs::create_dir_all(&data_dir).expect("data dir should be creatable");
    std::fs::write(data_dir.join("hr.sql"), HR_DDL).expect("hr ddl should be writable");
    let connection = Connection::open(data_dir.join("hr.db")).expect("hr store should open");
    connection
        .execute_batch(HR_DDL)
        .expect("hr ddl should apply to the store");
    connection
        .execute_batch(HR_SEED)
        .expect("hr seed should apply to the store");
    home
}

fn tabletalk(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tabletalk"))
        .arg("--home-dir")
        .arg(home)
        .arg("--cwd")
        .arg(home)
        .args(args)
        .output()
        .expect("command should execute")
}

fn envelope(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .last()
        .expect("command should print an envelope");
    serde_json::from_str(line).expect("stdout should be a json envelope")
}

#[test]
fn missing_required_args_exits_with_usage_code() {
    let status = Command::new(env!("CARGO_BIN_EXE_tabletalk"))
        .arg("ask")
        .status()
        .expect("command should execute");

    assert_eq!(status.code(), Some(EXIT_USAGE_ERROR));
}

#[test]
fn plan_schema_needs_no_runtime_paths() {
    let output = Command::new(env!("CARGO_BIN_EXE_tabletalk"))
        .arg("plan-schema")
        .output()
        .expect("command should execute");

    assert_eq!(output.status.code(), Some(EXIT_SUCCESS));
    let envelope = envelope(&output);
    assert_eq!(envelope["ok"], Value::Bool(true));
    assert_eq!(envelope["command"], "plan-schema");
    assert!(envelope["data"].is_object());
}

#[test]
fn ask_without_a_platform_is_an_input_failure() {
    let home = seeded_home("tabletalk-exit-no-platform");
    let output = tabletalk(&home, &["ask", "How many employees are in each department?"]);

    assert_eq!(output.status.code(), Some(EXIT_INPUT_FAILURE));
    let envelope = envelope(&output);
    assert_eq!(envelope["ok"], Value::Bool(false));
    assert_eq!(envelope["error"]["code"], "no_platform_selected");
    assert_eq!(envelope["error"]["class"], "input");
    assert_eq!(envelope["error"]["details"]["session_id"], "default");
}

#[test]
fn unregistered_platform_is_an_input_failure() {
    let home = seeded_home("tabletalk-exit-invalid-platform");
    let output = tabletalk(&home, &["select", "crm"]);

    assert_eq!(output.status.code(), Some(EXIT_INPUT_FAILURE));
    assert_eq!(envelope(&output)["error"]["code"], "invalid_platform");
}

#[test]
fn missing_schema_file_is_a_runtime_failure() {
    let home = seeded_home("tabletalk-exit-schema-load");
    let output = tabletalk(&home, &["select", "sevdesk"]);

    assert_eq!(output.status.code(), Some(EXIT_RUNTIME_FAILURE));
    let envelope = envelope(&output);
    assert_eq!(envelope["error"]["code"], "schema_load_error");
    assert_eq!(envelope["error"]["class"], "runtime");
    assert_eq!(envelope["error"]["details"]["platform"], "sevdesk");
}

#[test]
fn sessions_persist_across_invocations() {
    let home = seeded_home("tabletalk-exit-session");

    let select = tabletalk(&home, &["select", "hr", "--session", "s1"]);
    assert_eq!(select.status.code(), Some(EXIT_SUCCESS));

    let ask = tabletalk(
        &home,
        &[
            "ask",
            "How many employees are in each department?",
            "--session",
            "s1",
        ],
    );
    assert_eq!(ask.status.code(), Some(EXIT_SUCCESS));
    let ask = envelope(&ask);
    assert_eq!(ask["meta"]["status"], "succeeded");
    assert_eq!(ask["meta"]["sequence"], 1);
    assert_eq!(ask["data"]["turn"]["response"]["row_count"], 3);

    let history = tabletalk(&home, &["history", "--session", "s1"]);
    assert_eq!(history.status.code(), Some(EXIT_SUCCESS));
    let history = envelope(&history);
    assert_eq!(history["meta"]["platform"], "hr");
    assert_eq!(history["meta"]["count"], 2);
    assert_eq!(history["data"]["messages"][0]["role"], "user");

    assert!(
        home.join(".tabletalk")
            .join("state")
            .join("sessions.sqlite")
            .is_file()
    );
}

#[test]
fn failed_turns_still_exit_successfully_with_a_warning() {
    let home = seeded_home("tabletalk-exit-failed-turn");
    let output = tabletalk(
        &home,
        &["ask", "give employee 5 a raise", "--platform", "hr"],
    );

    assert_eq!(output.status.code(), Some(EXIT_SUCCESS));
    let envelope = envelope(&output);
    assert_eq!(envelope["ok"], Value::Bool(true));
    assert_eq!(envelope["meta"]["status"], "validation_rejected");
    assert_eq!(envelope["warnings"][0]["code"], "turn_failed");
}
