use serde_json::json;
use std::collections::{BTreeMap, HashMap};

use crate::ipc::error::ok;
use crate::ipc::handlers::{core_err, db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use crate::store::{self, ExamRecord};

// Chart feeds never fail on unknown ids; an empty series renders as an
// empty chart, which is what the frontend expects.

fn handle_marks_over_time(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let subject_id = optional_str(req, "subjectId");
    let mut exams = match store::load_student_exams(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    if let Some(subject_id) = &subject_id {
        exams.retain(|e| e.subject_id == *subject_id);
    }
    exams.sort_by(|a, b| a.date.cmp(&b.date).then(a.exam_no.cmp(&b.exam_no)));

    let points: Vec<serde_json::Value> = exams
        .iter()
        .map(|e| {
            json!({
                "date": e.date.format("%Y-%m-%d").to_string(),
                "percentage": scoring::percentage(e.mark_obtained, e.total_marks),
                "subjectName": e.subject_name,
                "examType": e.exam_type_name,
            })
        })
        .collect();
    ok(&req.id, json!({ "series": points }))
}

fn subject_averages(exams: &[ExamRecord]) -> Vec<serde_json::Value> {
    let mut by_subject: BTreeMap<String, Vec<ExamRecord>> = BTreeMap::new();
    for e in exams {
        by_subject
            .entry(e.subject_name.clone())
            .or_default()
            .push(e.clone());
    }
    by_subject
        .iter()
        .map(|(name, subset)| {
            let stats = scoring::aggregate(subset);
            json!({
                "subjectName": name,
                "averagePercentage": stats.average_percentage,
                "uniqueExamsCount": stats.unique_count,
            })
        })
        .collect()
}

fn handle_subject_performance(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let exams = match store::load_student_exams(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    ok(&req.id, json!({ "subjects": subject_averages(&exams) }))
}

fn grade_counts(exams: &[ExamRecord]) -> Vec<serde_json::Value> {
    let mut counts: HashMap<&'static str, i64> = HashMap::new();
    for e in exams {
        *counts.entry(scoring::exam_grade(e).label).or_insert(0) += 1;
    }
    let mut rows: Vec<serde_json::Value> = counts
        .iter()
        .map(|(label, count)| {
            json!({
                "grade": label,
                "count": count,
                "color": scoring::grade_color(label),
            })
        })
        .collect();
    rows.sort_by(|a, b| {
        b["count"]
            .as_i64()
            .unwrap_or(0)
            .cmp(&a["count"].as_i64().unwrap_or(0))
    });
    rows
}

fn handle_grade_distribution(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let exams = match store::load_student_exams(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    ok(&req.id, json!({ "grades": grade_counts(&exams) }))
}

fn handle_overall_grade_distribution(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let exams = match store::load_exams(conn, &store::ExamFilter::default()) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    ok(&req.id, json!({ "grades": grade_counts(&exams) }))
}

/// Side-by-side per-subject averages. Subjects either student sat are
/// included; a missing side reports null for that subject.
fn handle_student_comparison(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let first_id = match required_str(req, "firstStudentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let second_id = match required_str(req, "secondStudentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let first = match store::load_student_exams(conn, &first_id) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let second = match store::load_student_exams(conn, &second_id) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };

    let averages = |exams: &[ExamRecord]| -> BTreeMap<String, f64> {
        let mut by_subject: BTreeMap<String, Vec<ExamRecord>> = BTreeMap::new();
        for e in exams {
            by_subject
                .entry(e.subject_name.clone())
                .or_default()
                .push(e.clone());
        }
        by_subject
            .into_iter()
            .map(|(name, subset)| (name, scoring::aggregate(&subset).average_percentage))
            .collect()
    };
    let first_avg = averages(&first);
    let second_avg = averages(&second);

    let mut subjects: Vec<&String> = first_avg.keys().chain(second_avg.keys()).collect();
    subjects.sort();
    subjects.dedup();

    let rows: Vec<serde_json::Value> = subjects
        .iter()
        .map(|name| {
            json!({
                "subjectName": name,
                "first": first_avg.get(*name),
                "second": second_avg.get(*name),
            })
        })
        .collect();
    ok(&req.id, json!({ "subjects": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "charts.marksOverTime" => Some(handle_marks_over_time(state, req)),
        "charts.subjectPerformance" => Some(handle_subject_performance(state, req)),
        "charts.gradeDistribution" => Some(handle_grade_distribution(state, req)),
        "charts.overallGradeDistribution" => Some(handle_overall_grade_distribution(state, req)),
        "charts.studentComparison" => Some(handle_student_comparison(state, req)),
        _ => None,
    }
}
