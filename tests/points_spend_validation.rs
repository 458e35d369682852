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

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request_raw(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn spending_is_capped_by_points_remaining() {
    let workspace = temp_dir("restrack-points-spend");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "name": "Amina" }),
    );
    let student_id = student["studentId"].as_str().expect("id").to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "name": "Biology" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("id").to_string();

    // Sole performer in a past month: 20 exam points + 40 win bonus.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "exams.record",
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "examType": "CQ",
            "date": "2025-03-10",
            "totalMarks": 100,
            "markObtained": 90,
        }),
    );

    let spend = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "points.spend",
        json!({
            "studentId": student_id,
            "amount": 50,
            "description": "a very long reward label",
        }),
    );
    assert_eq!(spend["pointsRemaining"].as_i64(), Some(10));
    let spend_id = spend["spendId"].as_str().expect("spendId").to_string();

    // Ten points left, twenty requested.
    let rejected = request_raw(
        &mut stdin,
        &mut reader,
        "6",
        "points.spend",
        json!({ "studentId": student_id, "amount": 20 }),
    );
    assert_eq!(rejected["ok"].as_bool(), Some(false));
    assert_eq!(
        rejected["error"]["code"].as_str(),
        Some("insufficient_points")
    );
    assert_eq!(
        rejected["error"]["details"]["pointsRemaining"].as_i64(),
        Some(10)
    );

    let zero = request_raw(
        &mut stdin,
        &mut reader,
        "7",
        "points.spend",
        json!({ "studentId": student_id, "amount": 0 }),
    );
    assert_eq!(zero["error"]["code"].as_str(), Some("bad_params"));

    // The stored description is clipped to 15 characters.
    let history = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "points.history",
        json!({ "studentId": student_id }),
    );
    let spends = history["spends"].as_array().expect("spends");
    assert_eq!(spends.len(), 1);
    assert_eq!(spends[0]["description"].as_str(), Some("a very long rew"));
    assert_eq!(history["totalSpent"].as_i64(), Some(50));
    assert_eq!(history["highestSpend"].as_i64(), Some(50));

    let summary = request_ok(&mut stdin, &mut reader, "9", "points.summary", json!({}));
    let rows = summary["students"].as_array().expect("students");
    assert_eq!(rows[0]["pointsEarned"].as_i64(), Some(60));
    assert_eq!(rows[0]["pointsRemaining"].as_i64(), Some(10));

    // Deleting the spend restores the balance.
    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "points.spendDelete",
        json!({ "spendId": spend_id }),
    );
    assert_eq!(deleted["pointsRemaining"].as_i64(), Some(60));

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "points.history",
        json!({ "studentId": student_id }),
    );
    assert_eq!(history["spends"].as_array().map(|a| a.len()), Some(0));
    assert_eq!(history["totalSpent"].as_i64(), Some(0));
}
