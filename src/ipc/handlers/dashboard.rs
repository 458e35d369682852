use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;

use crate::ipc::error::{err, ok};
use crate::ipc::handlers::{core_err, db_conn, optional_i64, optional_month};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use crate::scoring::{self, CoreError};
use crate::store::{self, ExamFilter, ExamRecord};

const RECENT_LIMIT: usize = 10;

fn table_count(conn: &Connection, table: &str) -> Result<i64, CoreError> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
        .map_err(|e| CoreError::new("db_query_failed", e.to_string()))
}

fn filter_from_request(req: &Request) -> Result<ExamFilter, serde_json::Value> {
    Ok(ExamFilter {
        class_number: optional_i64(req, "classNumber"),
        month: optional_month(req, "month")?,
        ..ExamFilter::default()
    })
}

fn handle_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let filter = match filter_from_request(req) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let exams = match store::load_exams(conn, &filter) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let student_count = match table_count(conn, "students") {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let subject_count = match table_count(conn, "subjects") {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };

    let stats = scoring::aggregate(&exams);
    let excellence = scoring::excellence_rate(&exams, stats.unique_count);

    // Current front-runner across the filtered set.
    let mut grouped: HashMap<&str, Vec<&ExamRecord>> = HashMap::new();
    for e in &exams {
        grouped.entry(e.student_id.as_str()).or_default().push(e);
    }
    let ranked = scoring::rank_descending(
        grouped
            .iter()
            .map(|(id, set)| (ledger::rank_key(set), id.to_string()))
            .collect(),
    );
    let student_name = |student_id: &str| -> Result<String, CoreError> {
        conn.query_row(
            "SELECT name FROM students WHERE id = ?",
            [student_id],
            |row| row.get(0),
        )
        .map_err(|e| CoreError::new("db_query_failed", e.to_string()))
    };
    let top_student = match ranked.first() {
        Some(r) => {
            let name = match student_name(&r.item) {
                Ok(n) => n,
                Err(e) => return core_err(req, e),
            };
            json!({
                "studentId": r.item,
                "studentName": name,
                "averagePercentage": r.key.average_percentage,
            })
        }
        None => serde_json::Value::Null,
    };

    // Highest raw marks, independent of average.
    let top_scorer = {
        let best = grouped
            .iter()
            .map(|(id, set)| {
                let total: i64 = set.iter().map(|e| e.mark_obtained).sum();
                (*id, total)
            })
            .max_by_key(|&(_, total)| total);
        match best {
            Some((student_id, total)) => {
                let name = match student_name(student_id) {
                    Ok(n) => n,
                    Err(e) => return core_err(req, e),
                };
                json!({
                    "studentId": student_id,
                    "studentName": name,
                    "totalMarks": total,
                })
            }
            None => serde_json::Value::Null,
        }
    };

    ok(
        &req.id,
        json!({
            "studentCount": student_count,
            "subjectCount": subject_count,
            "uniqueExamsCount": stats.unique_count,
            "recordCount": stats.record_count,
            "averagePercentage": stats.average_percentage,
            "excellenceRate": excellence,
            "topStudent": top_student,
            "topScorer": top_scorer,
        }),
    )
}

fn handle_subjects(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let filter = match filter_from_request(req) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let exams = match store::load_exams(conn, &filter) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };

    let mut by_subject: HashMap<(String, String), Vec<ExamRecord>> = HashMap::new();
    for e in &exams {
        by_subject
            .entry((e.subject_id.clone(), e.subject_name.clone()))
            .or_default()
            .push(e.clone());
    }
    let mut rows: Vec<serde_json::Value> = by_subject
        .iter()
        .map(|((id, name), subset)| {
            let stats = scoring::aggregate(subset);
            json!({
                "subjectId": id,
                "subjectName": name,
                "averagePercentage": stats.average_percentage,
                "uniqueExamsCount": stats.unique_count,
                "recordCount": stats.record_count,
            })
        })
        .collect();
    rows.sort_by(|a, b| {
        a["subjectName"]
            .as_str()
            .unwrap_or("")
            .cmp(b["subjectName"].as_str().unwrap_or(""))
    });
    ok(&req.id, json!({ "subjects": rows }))
}

fn handle_exam_types(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let filter = match filter_from_request(req) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let exams = match store::load_exams(conn, &filter) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };

    let mut by_type: HashMap<(String, String), Vec<ExamRecord>> = HashMap::new();
    for e in &exams {
        by_type
            .entry((e.exam_type_id.clone(), e.exam_type_name.clone()))
            .or_default()
            .push(e.clone());
    }
    let mut rows: Vec<serde_json::Value> = by_type
        .iter()
        .map(|((id, name), subset)| {
            let stats = scoring::aggregate(subset);
            json!({
                "examTypeId": id,
                "examTypeName": name,
                "averagePercentage": stats.average_percentage,
                "uniqueExamsCount": stats.unique_count,
                "recordCount": stats.record_count,
            })
        })
        .collect();
    rows.sort_by(|a, b| {
        a["examTypeName"]
            .as_str()
            .unwrap_or("")
            .cmp(b["examTypeName"].as_str().unwrap_or(""))
    });
    ok(&req.id, json!({ "examTypes": rows }))
}

/// Per-grade record counts. Chart colors come from grade_scales when
/// the operator seeded them; the built-in palette covers the rest.
/// grade_scales never decides the grade itself.
fn handle_grade_distribution(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let filter = match filter_from_request(req) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let exams = match store::load_exams(conn, &filter) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };

    let scale_colors: HashMap<String, String> = {
        let mut stmt = match conn.prepare("SELECT grade_name, color_code FROM grade_scales") {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>());
        match rows {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let mut counts: HashMap<&'static str, i64> = HashMap::new();
    for e in &exams {
        *counts.entry(scoring::exam_grade(e).label).or_insert(0) += 1;
    }
    let mut rows: Vec<serde_json::Value> = counts
        .iter()
        .map(|(label, count)| {
            let color = scale_colors
                .get(*label)
                .cloned()
                .unwrap_or_else(|| scoring::grade_color(label).to_string());
            json!({ "grade": label, "count": count, "color": color })
        })
        .collect();
    rows.sort_by(|a, b| {
        b["count"]
            .as_i64()
            .unwrap_or(0)
            .cmp(&a["count"].as_i64().unwrap_or(0))
    });
    ok(&req.id, json!({ "grades": rows }))
}

fn handle_recent_exams(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let filter = match filter_from_request(req) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let exams = match store::load_exams(conn, &filter) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let names: HashMap<String, String> = {
        let mut stmt = match conn.prepare("SELECT id, name FROM students") {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>());
        match rows {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let rows: Vec<serde_json::Value> = exams
        .iter()
        .take(RECENT_LIMIT)
        .map(|e| {
            let grade = scoring::exam_grade(e);
            json!({
                "id": e.id,
                "studentId": e.student_id,
                "studentName": names.get(&e.student_id),
                "subjectName": e.subject_name,
                "examType": e.exam_type_name,
                "date": e.date.format("%Y-%m-%d").to_string(),
                "totalMarks": e.total_marks,
                "markObtained": e.mark_obtained,
                "percentage": scoring::percentage(e.mark_obtained, e.total_marks),
                "grade": grade.label,
                "gradeColor": grade.color,
            })
        })
        .collect();
    ok(&req.id, json!({ "exams": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.summary" => Some(handle_summary(state, req)),
        "dashboard.subjects" => Some(handle_subjects(state, req)),
        "dashboard.examTypes" => Some(handle_exam_types(state, req)),
        "dashboard.gradeDistribution" => Some(handle_grade_distribution(state, req)),
        "dashboard.recentExams" => Some(handle_recent_exams(state, req)),
        _ => None,
    }
}
