use chrono::Datelike;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::handlers::{core_err, db_conn, optional_str, required_str, today};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use crate::scoring::{self, CoreError, RankKey};
use crate::store::{self, ExamFilter, ExamRecord};

#[derive(Debug, Clone)]
struct StudentRow {
    id: String,
    name: String,
    roll: Option<String>,
    class_name: Option<String>,
}

fn load_students(conn: &Connection) -> Result<Vec<StudentRow>, CoreError> {
    let mut stmt = conn
        .prepare("SELECT id, name, roll, class_name FROM students ORDER BY name")
        .map_err(|e| CoreError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([], |r| {
        Ok(StudentRow {
            id: r.get(0)?,
            name: r.get(1)?,
            roll: r.get(2)?,
            class_name: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| CoreError::new("db_query_failed", e.to_string()))
}

fn load_student(conn: &Connection, student_id: &str) -> Result<Option<StudentRow>, CoreError> {
    conn.query_row(
        "SELECT id, name, roll, class_name FROM students WHERE id = ?",
        [student_id],
        |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                name: r.get(1)?,
                roll: r.get(2)?,
                class_name: r.get(3)?,
            })
        },
    )
    .optional()
    .map_err(|e| CoreError::new("db_query_failed", e.to_string()))
}

fn student_json(s: &StudentRow) -> serde_json::Value {
    json!({
        "id": s.id,
        "name": s.name,
        "roll": s.roll,
        "className": s.class_name,
    })
}

fn partition_by_student(exams: &[ExamRecord]) -> HashMap<&str, Vec<&ExamRecord>> {
    let mut grouped: HashMap<&str, Vec<&ExamRecord>> = HashMap::new();
    for e in exams {
        grouped.entry(e.student_id.as_str()).or_default().push(e);
    }
    grouped
}

fn set_key(exams: &[&ExamRecord]) -> RankKey {
    ledger::rank_key(exams)
}

fn owned(refs: &[&ExamRecord]) -> Vec<ExamRecord> {
    refs.iter().map(|e| (*e).clone()).collect()
}

/// Global competition ranks across every student, including ones with
/// no exams yet (they carry a zero key).
fn global_rank_map(
    students: &[StudentRow],
    exams: &[ExamRecord],
) -> HashMap<String, usize> {
    let grouped = partition_by_student(exams);
    let entries: Vec<(RankKey, String)> = students
        .iter()
        .map(|s| {
            let key = grouped
                .get(s.id.as_str())
                .map(|set| set_key(set))
                .unwrap_or(RankKey {
                    average_percentage: 0.0,
                    total_marks: 0.0,
                });
            (key, s.id.clone())
        })
        .collect();
    scoring::rank_descending(entries)
        .into_iter()
        .map(|r| (r.item, r.rank))
        .collect()
}

/// How many subjects this student currently tops (ties included).
fn subject_champion_count(all_exams: &[ExamRecord], student_id: &str) -> usize {
    let mut by_subject: HashMap<&str, Vec<&ExamRecord>> = HashMap::new();
    for e in all_exams {
        by_subject.entry(e.subject_id.as_str()).or_default().push(e);
    }

    let mut count = 0;
    for subject_exams in by_subject.values() {
        let mut per_student: HashMap<&str, Vec<&ExamRecord>> = HashMap::new();
        for e in subject_exams {
            per_student.entry(e.student_id.as_str()).or_default().push(e);
        }
        let Some(own) = per_student.get(student_id) else {
            continue;
        };
        let own_key = set_key(own);
        let ranked = scoring::rank_descending(
            per_student
                .iter()
                .map(|(id, set)| (set_key(set), id.to_string()))
                .collect(),
        );
        if scoring::tied_for_top(&ranked, &own_key) {
            count += 1;
        }
    }
    count
}

/// Per-subject rank of one student among everyone with exams in that
/// subject, or None if the student has none there.
fn subject_rank(all_exams: &[ExamRecord], subject_id: &str, student_id: &str) -> Option<usize> {
    let subject_exams: Vec<&ExamRecord> = all_exams
        .iter()
        .filter(|e| e.subject_id == subject_id)
        .collect();
    let mut per_student: HashMap<&str, Vec<&ExamRecord>> = HashMap::new();
    for e in &subject_exams {
        per_student.entry(e.student_id.as_str()).or_default().push(e);
    }
    per_student.get(student_id)?;
    let ranked = scoring::rank_descending(
        per_student
            .iter()
            .map(|(id, set)| (set_key(set), id.to_string()))
            .collect(),
    );
    ranked
        .iter()
        .find(|r| r.item == student_id)
        .map(|r| r.rank)
}

fn subject_summary_json(all_exams: &[ExamRecord], own: &[ExamRecord]) -> Vec<serde_json::Value> {
    let mut by_subject: HashMap<&str, (String, Vec<ExamRecord>)> = HashMap::new();
    for e in own {
        by_subject
            .entry(e.subject_id.as_str())
            .or_insert_with(|| (e.subject_name.clone(), Vec::new()))
            .1
            .push(e.clone());
    }
    let mut out: Vec<serde_json::Value> = by_subject
        .iter()
        .map(|(subject_id, (subject_name, exams))| {
            let stats = scoring::aggregate(exams);
            json!({
                "subjectId": subject_id,
                "subjectName": subject_name,
                "totalMarks": stats.total_obtained,
                "examCount": stats.unique_count,
                "averagePercentage": stats.average_percentage,
                "rank": subject_rank(all_exams, subject_id, own[0].student_id.as_str()),
            })
        })
        .collect();
    out.sort_by(|a, b| {
        a.get("subjectName")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .cmp(b.get("subjectName").and_then(|v| v.as_str()).unwrap_or(""))
    });
    out
}

fn exam_type_summary_json(own: &[ExamRecord]) -> Vec<serde_json::Value> {
    let mut by_type: HashMap<&str, Vec<ExamRecord>> = HashMap::new();
    for e in own {
        by_type
            .entry(e.exam_type_name.as_str())
            .or_default()
            .push(e.clone());
    }
    let mut out: Vec<serde_json::Value> = by_type
        .iter()
        .map(|(type_name, exams)| {
            let stats = scoring::aggregate(exams);
            json!({
                "examType": type_name,
                "totalMarks": stats.total_obtained,
                "examCount": stats.unique_count,
                "averagePercentage": stats.average_percentage,
            })
        })
        .collect();
    out.sort_by(|a, b| {
        a.get("examType")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .cmp(b.get("examType").and_then(|v| v.as_str()).unwrap_or(""))
    });
    out
}

fn grade_frequency_json(own: &[ExamRecord]) -> Vec<serde_json::Value> {
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    for e in own {
        *counts.entry(scoring::exam_grade(e).label).or_insert(0) += 1;
    }
    let mut out: Vec<serde_json::Value> = counts
        .into_iter()
        .map(|(label, count)| {
            json!({
                "grade": label,
                "count": count,
                "color": scoring::grade_color(label),
            })
        })
        .collect();
    out.sort_by(|a, b| {
        b.get("count")
            .and_then(|v| v.as_u64())
            .cmp(&a.get("count").and_then(|v| v.as_u64()))
    });
    out
}

fn exam_json(e: &ExamRecord) -> serde_json::Value {
    let grade = scoring::exam_grade(e);
    json!({
        "id": e.id,
        "studentId": e.student_id,
        "subjectId": e.subject_id,
        "subjectName": e.subject_name,
        "examType": e.exam_type_name,
        "date": e.date.format("%Y-%m-%d").to_string(),
        "chapter": e.chapter,
        "classNumber": e.class_number,
        "totalMarks": e.total_marks,
        "markObtained": e.mark_obtained,
        "groupId": e.group_id,
        "examNo": e.exam_no,
        "percentage": scoring::percentage(e.mark_obtained, e.total_marks),
        "grade": grade.label,
        "gradeColor": grade.color,
        "pointsEarned": grade.points,
    })
}

/// Best past months by weighted average, with per-month exam points.
fn best_months_json(own: &[ExamRecord], limit: usize) -> Vec<serde_json::Value> {
    let now = today();
    let mut months: Vec<(i32, u32)> = own
        .iter()
        .map(|e| (e.date.year(), e.date.month()))
        .filter(|&(y, m)| ledger::month_has_passed(y, m, now))
        .collect();
    months.sort_unstable();
    months.dedup();

    let mut rows: Vec<serde_json::Value> = months
        .into_iter()
        .map(|(year, month)| {
            let month_exams: Vec<ExamRecord> = own
                .iter()
                .filter(|e| e.date.year() == year && e.date.month() == month)
                .cloned()
                .collect();
            let stats = scoring::aggregate(&month_exams);
            let points: i64 = month_exams
                .iter()
                .map(|e| scoring::exam_grade(e).points)
                .sum();
            json!({
                "monthName": store::month_label(year, month),
                "year": year,
                "month": month,
                "examsCount": stats.unique_count,
                "averagePercentage": stats.average_percentage,
                "pointsEarned": points,
            })
        })
        .collect();
    rows.sort_by(|a, b| {
        let av = a
            .get("averagePercentage")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let bv = b
            .get("averagePercentage")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        bv.partial_cmp(&av).unwrap_or(std::cmp::Ordering::Equal)
    });
    rows.truncate(limit);
    rows
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let roll = optional_str(req, "roll");
    let class_name = optional_str(req, "className");
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, name, roll, class_name, created_at)
         VALUES (?, ?, ?, ?, datetime('now'))",
        (&id, &name, &roll, &class_name),
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "studentId": id }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let students = match load_students(conn) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let all_exams = match store::load_exams(conn, &ExamFilter::default()) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let ranks = global_rank_map(&students, &all_exams);
    let grouped = partition_by_student(&all_exams);

    let rows: Vec<serde_json::Value> = students
        .iter()
        .map(|s| {
            let stats = grouped
                .get(s.id.as_str())
                .map(|set| scoring::aggregate(&owned(set)))
                .unwrap_or_else(|| scoring::aggregate(&[]));
            let mut row = student_json(s);
            row["totalMarks"] = json!(stats.total_obtained);
            row["totalExams"] = json!(stats.unique_count);
            row["averagePercentage"] = json!(stats.average_percentage);
            row["rank"] = json!(ranks.get(&s.id));
            row
        })
        .collect();
    ok(&req.id, json!({ "students": rows }))
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student = match load_student(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return core_err(req, e),
    };
    let all_exams = match store::load_exams(conn, &ExamFilter::default()) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let own: Vec<ExamRecord> = all_exams
        .iter()
        .filter(|e| e.student_id == student_id)
        .cloned()
        .collect();
    let stats = scoring::aggregate(&own);
    let snapshot = match ledger::ledger_snapshot(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let students = match load_students(conn) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let ranks = global_rank_map(&students, &all_exams);

    let subject_summary = if own.is_empty() {
        Vec::new()
    } else {
        subject_summary_json(&all_exams, &own)
    };

    ok(
        &req.id,
        json!({
            "student": student_json(&student),
            "totalMarks": stats.total_obtained,
            "totalExams": stats.unique_count,
            "averagePercentage": stats.average_percentage,
            "rank": ranks.get(&student_id),
            "subjectSummary": subject_summary,
            "examTypeSummary": exam_type_summary_json(&own),
            "gradeFrequency": grade_frequency_json(&own),
            "recentExams": own.iter().take(10).map(exam_json).collect::<Vec<_>>(),
            "lifetimePoints": {
                "pointsEarned": snapshot.points_earned,
                "pointsSpent": snapshot.points_spent,
                "pointsRemaining": snapshot.points_remaining(),
            },
            "excellenceRate": scoring::excellence_rate(&own, stats.unique_count),
            "monthlyWinnerCount": ledger::monthly_wins_over(&all_exams, &student_id, today()),
            "subjectChampionCount": subject_champion_count(&all_exams, &student_id),
            "bestMonths": best_months_json(&own, 5),
        }),
    )
}

fn compare_stats_json(
    all_exams: &[ExamRecord],
    students: &[StudentRow],
    student: &StudentRow,
    snapshot: ledger::LedgerSnapshot,
) -> serde_json::Value {
    let own: Vec<ExamRecord> = all_exams
        .iter()
        .filter(|e| e.student_id == student.id)
        .cloned()
        .collect();
    let stats = scoring::aggregate(&own);
    let ranks = global_rank_map(students, all_exams);

    let type_average = |type_name: &str| {
        let subset: Vec<ExamRecord> = own
            .iter()
            .filter(|e| e.exam_type_name.trim().eq_ignore_ascii_case(type_name))
            .cloned()
            .collect();
        scoring::aggregate(&subset).average_percentage
    };

    let best_month = best_months_json(&own, 1)
        .first()
        .and_then(|m| m.get("monthName").cloned())
        .unwrap_or(json!("N/A"));

    json!({
        "student": student_json(student),
        "totalMarks": stats.total_obtained,
        "averagePercentage": stats.average_percentage,
        "totalExams": stats.unique_count,
        "rank": ranks.get(&student.id),
        "excellenceRate": scoring::excellence_rate(&own, stats.unique_count),
        "monthlyWinnerCount": ledger::monthly_wins_over(all_exams, &student.id, today()),
        "subjectChampionCount": subject_champion_count(all_exams, &student.id),
        "bestMonth": best_month,
        "subjectSummary": if own.is_empty() { Vec::new() } else { subject_summary_json(all_exams, &own) },
        "lifetimePoints": snapshot.points_earned,
        "mcqAverage": type_average("MCQ"),
        "cqAverage": type_average("CQ"),
    })
}

fn handle_compare(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let first_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let second_id = optional_str(req, "otherStudentId");

    let first = match load_student(conn, &first_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return core_err(req, e),
    };
    let second = match &second_id {
        Some(id) => match load_student(conn, id) {
            Ok(Some(s)) => Some(s),
            Ok(None) => return err(&req.id, "not_found", "comparison student not found", None),
            Err(e) => return core_err(req, e),
        },
        None => None,
    };

    let all_exams = match store::load_exams(conn, &ExamFilter::default()) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let students = match load_students(conn) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };

    let first_snapshot = match ledger::ledger_snapshot(conn, &first.id) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let first_stats = compare_stats_json(&all_exams, &students, &first, first_snapshot);
    let second_stats = match &second {
        Some(s) => {
            let snapshot = match ledger::ledger_snapshot(conn, &s.id) {
                Ok(v) => v,
                Err(e) => return core_err(req, e),
            };
            Some(compare_stats_json(&all_exams, &students, s, snapshot))
        }
        None => None,
    };

    ok(
        &req.id,
        json!({
            "first": first_stats,
            "second": second_stats,
        }),
    )
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match load_student(conn, &student_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return core_err(req, e),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    // Explicit cascade: exams, ledger and spend history go with the
    // student.
    let steps = [
        "DELETE FROM exams WHERE student_id = ?",
        "DELETE FROM points_spent WHERE student_id = ?",
        "DELETE FROM lifetime_points WHERE student_id = ?",
        "DELETE FROM students WHERE id = ?",
    ];
    for sql in steps {
        if let Err(e) = tx.execute(sql, [&student_id]) {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_create(state, req)),
        "students.list" => Some(handle_list(state, req)),
        "students.get" => Some(handle_get(state, req)),
        "students.compare" => Some(handle_compare(state, req)),
        "students.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
