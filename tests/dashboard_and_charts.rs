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
fn dashboard_and_chart_feeds_reflect_recorded_exams() {
    let workspace = temp_dir("restrack-dashboard");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "2", "setup.gradeScales", json!({}));

    let amina = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "name": "Amina" }),
    );
    let amina_id = amina["studentId"].as_str().expect("id").to_string();
    let rafi = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "name": "Rafi" }),
    );
    let rafi_id = rafi["studentId"].as_str().expect("id").to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.create",
        json!({ "name": "Physics" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("id").to_string();

    let marks = [
        (&amina_id, "CQ", "2025-03-05", 85),  // Superb, excellent
        (&amina_id, "MCQ", "2025-03-18", 84), // Good, below MCQ excellence
        (&rafi_id, "CQ", "2025-03-22", 45),   // Poor
    ];
    for (i, (student, exam_type, date, mark)) in marks.iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("e{}", i),
            "exams.record",
            json!({
                "studentId": student,
                "subjectId": subject_id,
                "examType": exam_type,
                "date": date,
                "totalMarks": 100,
                "markObtained": mark,
            }),
        );
    }

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "dashboard.summary",
        json!({}),
    );
    assert_eq!(summary["studentCount"].as_i64(), Some(2));
    assert_eq!(summary["subjectCount"].as_i64(), Some(1));
    assert_eq!(summary["uniqueExamsCount"].as_u64(), Some(3));
    assert_eq!(
        summary["topStudent"]["studentName"].as_str(),
        Some("Amina")
    );
    // One excellent record out of three unique exams.
    let rate = summary["excellenceRate"].as_f64().expect("rate");
    assert!((rate - 100.0 / 3.0).abs() < 1e-9);

    let distribution = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "dashboard.gradeDistribution",
        json!({}),
    );
    let grades = distribution["grades"].as_array().expect("grades");
    assert_eq!(grades.len(), 3);
    let superb = grades
        .iter()
        .find(|g| g["grade"].as_str() == Some("Superb"))
        .expect("superb bucket");
    assert_eq!(superb["count"].as_i64(), Some(1));
    assert_eq!(superb["color"].as_str(), Some("#A7F3D0"));

    let over_time = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "charts.marksOverTime",
        json!({ "studentId": amina_id }),
    );
    let series = over_time["series"].as_array().expect("series");
    assert_eq!(series.len(), 2);
    assert_eq!(series[0]["date"].as_str(), Some("2025-03-05"));
    assert_eq!(series[0]["percentage"].as_f64(), Some(85.0));

    let comparison = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "charts.studentComparison",
        json!({ "firstStudentId": amina_id, "secondStudentId": rafi_id }),
    );
    let rows = comparison["subjects"].as_array().expect("subjects");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["first"].as_f64(), Some(84.5));
    assert_eq!(rows[0]["second"].as_f64(), Some(45.0));

    // Unknown student yields an empty chart, not an error.
    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "charts.subjectPerformance",
        json!({ "studentId": "no-such-student" }),
    );
    assert_eq!(empty["subjects"].as_array().map(|a| a.len()), Some(0));

    let scales = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "gradeScales.list",
        json!({}),
    );
    assert_eq!(
        scales["gradeScales"].as_array().map(|a| a.len()),
        Some(6)
    );
}
