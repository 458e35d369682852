use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_restrackd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn restrackd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_raw(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

#[test]
fn health_unknown_methods_and_missing_workspace() {
    let workspace = temp_dir("restrack-router-smoke");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_raw(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["ok"].as_bool(), Some(true));
    assert_eq!(
        health["result"]["version"].as_str(),
        Some(env!("CARGO_PKG_VERSION"))
    );
    assert!(health["result"]["workspacePath"].is_null());

    // Data methods refuse to run before a workspace is selected.
    let no_workspace = request_raw(&mut stdin, &mut reader, "2", "students.list", json!({}));
    assert_eq!(no_workspace["ok"].as_bool(), Some(false));
    assert_eq!(
        no_workspace["error"]["code"].as_str(),
        Some("no_workspace")
    );

    let unknown = request_raw(&mut stdin, &mut reader, "3", "nope.doesNotExist", json!({}));
    assert_eq!(unknown["ok"].as_bool(), Some(false));
    assert_eq!(
        unknown["error"]["code"].as_str(),
        Some("not_implemented")
    );

    let selected = request_raw(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected["ok"].as_bool(), Some(true));

    // Validation errors carry structured codes.
    let bad = request_raw(
        &mut stdin,
        &mut reader,
        "5",
        "exams.record",
        json!({ "studentId": "missing" }),
    );
    assert_eq!(bad["ok"].as_bool(), Some(false));
    assert_eq!(bad["error"]["code"].as_str(), Some("not_found"));

    let empty_name = request_raw(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({ "name": "   " }),
    );
    assert_eq!(empty_name["error"]["code"].as_str(), Some("bad_params"));
}
