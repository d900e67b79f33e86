#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;

fn mobilize_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_mobilize") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/mobilize");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "mobilize-pipeline-cli", "--bin", "mobilize"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build mobilize binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn mobilize_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(mobilize_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run mobilize command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn temp_db(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "mobilize-cli-{}-{}.sqlite3",
        name,
        std::process::id()
    ));
    cleanup_db(&path);
    path
}

fn cleanup_db(path: &Path) {
    let _ = std::fs::remove_file(path);
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_os_string();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(sidecar));
    }
}

fn id_of(value: &Value, field: &str) -> String {
    match value.get(field).and_then(Value::as_i64) {
        Some(id) => id.to_string(),
        None => panic!("missing integer field {field} in {value}"),
    }
}

#[test]
fn assignment_flow_counts_and_history() {
    let db = temp_db("flow");

    let pipeline = stdout_json(&{
        let output = mobilize_output(
            &db,
            &[
                "pipeline",
                "create",
                "--name",
                "People Pipeline",
                "--pipeline-type",
                "people",
                "--main",
            ],
        );
        assert_success(&output);
        output
    });
    let pipeline_id = id_of(&pipeline, "pipeline_id");

    let mut stage_ids = Vec::new();
    for (name, ordinal) in [("Intake", "1"), ("Engaged", "2"), ("Committed", "3")] {
        let output = mobilize_output(
            &db,
            &[
                "stage",
                "add",
                "--pipeline-id",
                &pipeline_id,
                "--name",
                name,
                "--ordinal",
                ordinal,
            ],
        );
        assert_success(&output);
        stage_ids.push(id_of(&stdout_json(&output), "stage_id"));
    }

    let contact = stdout_json(&{
        let output = mobilize_output(
            &db,
            &[
                "contact",
                "add",
                "--contact-type",
                "person",
                "--owner",
                "owner@example.org",
            ],
        );
        assert_success(&output);
        output
    });
    let contact_id = id_of(&contact, "contact_id");

    let assignment = stdout_json(&{
        let output = mobilize_output(
            &db,
            &[
                "assign",
                "--contact-id",
                &contact_id,
                "--pipeline-id",
                &pipeline_id,
                "--stage-id",
                &stage_ids[0],
                "--moved-by",
                "tester",
            ],
        );
        assert_success(&output);
        output
    });
    assert_eq!(assignment["transition"], Value::from("entered"));

    let counts = stdout_json(&{
        let output = mobilize_output(
            &db,
            &["counts", "--pipeline-id", &pipeline_id, "--by-stage"],
        );
        assert_success(&output);
        output
    });
    assert_eq!(counts["total"], Value::from(1));
    let stages = match counts["stages"].as_array() {
        Some(value) => value,
        None => panic!("missing stages array in {counts}"),
    };
    assert_eq!(stages.len(), 3);
    assert_eq!(stages[0]["count"], Value::from(1));
    assert_eq!(stages[1]["count"], Value::from(0));
    assert_eq!(stages[2]["count"], Value::from(0));

    let moved = stdout_json(&{
        let output = mobilize_output(
            &db,
            &[
                "assign",
                "--contact-id",
                &contact_id,
                "--pipeline-id",
                &pipeline_id,
                "--stage-id",
                &stage_ids[1],
                "--moved-by",
                "tester",
                "--notes",
                "follow-up call done",
            ],
        );
        assert_success(&output);
        output
    });
    assert_eq!(moved["transition"], Value::from("moved"));

    let history = stdout_json(&{
        let output = mobilize_output(
            &db,
            &[
                "history",
                "--contact-id",
                &contact_id,
                "--pipeline-id",
                &pipeline_id,
            ],
        );
        assert_success(&output);
        output
    });
    let records = match history.as_array() {
        Some(value) => value,
        None => panic!("history output is not an array: {history}"),
    };
    assert_eq!(records.len(), 2);
    assert!(records[0]["from_stage_id"].is_null());
    assert_eq!(records[1]["notes"], Value::from("follow-up call done"));

    let conn = match Connection::open(&db) {
        Ok(value) => value,
        Err(err) => panic!("failed to open test db: {err}"),
    };
    let null_created: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM pipeline_stage_history WHERE created_at IS NULL",
        [],
        |row| row.get(0),
    ) {
        Ok(value) => value,
        Err(err) => panic!("failed to query history: {err}"),
    };
    assert_eq!(null_created, 0);

    drop(conn);
    cleanup_db(&db);
}

#[test]
fn main_pipeline_resolution_is_deterministic() {
    let db = temp_db("main");

    let first = stdout_json(&{
        let output = mobilize_output(
            &db,
            &[
                "pipeline",
                "create",
                "--name",
                "People Pipeline",
                "--pipeline-type",
                "people",
                "--main",
            ],
        );
        assert_success(&output);
        output
    });

    let output = mobilize_output(
        &db,
        &[
            "pipeline",
            "create",
            "--name",
            "Shadow People Pipeline",
            "--pipeline-type",
            "people",
            "--main",
        ],
    );
    assert_success(&output);

    let resolved = stdout_json(&{
        let output = mobilize_output(&db, &["pipeline", "main", "--contact-type", "person"]);
        assert_success(&output);
        output
    });
    assert_eq!(resolved["pipeline_id"], first["pipeline_id"]);

    cleanup_db(&db);
}

#[test]
fn core_failures_print_a_stable_error_envelope() {
    let db = temp_db("envelope");

    let output = mobilize_output(
        &db,
        &[
            "pipeline",
            "create",
            "--name",
            "People Pipeline",
            "--pipeline-type",
            "people",
        ],
    );
    assert_success(&output);

    let failed = mobilize_output(
        &db,
        &[
            "assign",
            "--contact-id",
            "999",
            "--pipeline-id",
            "1",
            "--stage-id",
            "1",
            "--moved-by",
            "tester",
        ],
    );
    assert!(!failed.status.success());
    let stderr = String::from_utf8_lossy(&failed.stderr);
    assert!(
        stderr.contains("\"kind\""),
        "expected error envelope on stderr, got: {stderr}"
    );

    cleanup_db(&db);
}

#[test]
fn schema_commands_probe_and_patch_columns() {
    let db = temp_db("schema");

    let check = stdout_json(&{
        let output = mobilize_output(
            &db,
            &[
                "schema",
                "check",
                "--table",
                "pipeline_stage_history",
                "--column",
                "created_at",
            ],
        );
        assert_success(&output);
        output
    });
    assert_eq!(check["present"], Value::from(true));

    let ensure_args = [
        "schema",
        "ensure",
        "--table",
        "contacts",
        "--column",
        "phone",
        "--definition",
        "TEXT",
    ];

    let applied = stdout_json(&{
        let output = mobilize_output(&db, &ensure_args);
        assert_success(&output);
        output
    });
    assert_eq!(applied["outcome"], Value::from("applied"));

    let repeated = stdout_json(&{
        let output = mobilize_output(&db, &ensure_args);
        assert_success(&output);
        output
    });
    assert_eq!(repeated["outcome"], Value::from("already_present"));

    cleanup_db(&db);
}
