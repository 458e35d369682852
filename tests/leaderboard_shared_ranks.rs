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

fn request_ok(
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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn tied_students_share_a_rank_and_the_next_rank_skips() {
    let workspace = temp_dir("restrack-leaderboard-ranks");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let mut students = Vec::new();
    for (i, name) in ["Amina", "Rafi", "Tisha"].iter().enumerate() {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "students.create",
            json!({ "name": name }),
        );
        students.push(created["studentId"].as_str().expect("id").to_string());
    }
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "name": "Math" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("id").to_string();

    // May 2025: two students at exactly 45/50, one at 30/50.
    for (i, (student, mark)) in [(0usize, 45), (1, 45), (2, 30)].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("e{}", i),
            "exams.record",
            json!({
                "studentId": students[*student],
                "subjectId": subject_id,
                "examType": "CQ",
                "date": format!("2025-05-{:02}", 10 + i),
                "totalMarks": 50,
                "markObtained": mark,
            }),
        );
    }

    let overall = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "leaderboard.overall",
        json!({}),
    );
    let entries = overall["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0]["rank"].as_u64(), Some(1));
    assert_eq!(entries[1]["rank"].as_u64(), Some(1));
    assert_eq!(entries[2]["rank"].as_u64(), Some(3));
    // Both winners carry exam points plus the shared monthly bonus.
    assert_eq!(entries[0]["points"].as_i64(), Some(60));
    assert_eq!(entries[1]["points"].as_i64(), Some(60));
    assert_eq!(entries[2]["points"].as_i64(), Some(0));

    let subjects = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "leaderboard.subjects",
        json!({}),
    );
    let board = &subjects["subjects"].as_array().expect("subjects")[0];
    assert_eq!(board["subjectName"].as_str(), Some("Math"));
    assert_eq!(board["bestScore"].as_f64(), Some(90.0));
    let board_entries = board["entries"].as_array().expect("entries");
    assert_eq!(board_entries[0]["rank"].as_u64(), Some(1));
    assert_eq!(board_entries[1]["rank"].as_u64(), Some(1));
    assert_eq!(board_entries[2]["rank"].as_u64(), Some(3));

    let monthly = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "leaderboard.monthly",
        json!({}),
    );
    let months = monthly["months"].as_array().expect("months");
    assert_eq!(months.len(), 1);
    assert_eq!(months[0]["month"].as_str(), Some("2025-05"));
    assert_eq!(months[0]["label"].as_str(), Some("May 2025"));
    let month_entries = months[0]["entries"].as_array().expect("entries");
    assert_eq!(month_entries[0]["rank"].as_u64(), Some(1));
    assert_eq!(month_entries[1]["rank"].as_u64(), Some(1));
    // Monthly board points are the month's exam points only.
    assert_eq!(month_entries[0]["points"].as_i64(), Some(20));
}
