use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;

use crate::ipc::error::{err, ok};
use crate::ipc::handlers::{core_err, db_conn, optional_i64, today};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use crate::scoring::{self, CoreError};
use crate::store::{self, ExamFilter, ExamRecord};

const BOARD_LIMIT: usize = 10;

fn student_names(conn: &Connection) -> Result<HashMap<String, String>, CoreError> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM students")
        .map_err(|e| CoreError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(|e| CoreError::new("db_query_failed", e.to_string()))
}

fn by_student(exams: &[ExamRecord]) -> HashMap<String, Vec<&ExamRecord>> {
    let mut grouped: HashMap<String, Vec<&ExamRecord>> = HashMap::new();
    for e in exams {
        grouped.entry(e.student_id.clone()).or_default().push(e);
    }
    grouped
}

struct BoardEntry {
    student_id: String,
    points: i64,
    exam_count: usize,
    record_count: usize,
    excellence_rate: f64,
}

fn board_json(
    ranked: &[scoring::Ranked<BoardEntry>],
    names: &HashMap<String, String>,
    limit: usize,
) -> Vec<serde_json::Value> {
    ranked
        .iter()
        .take(limit)
        .map(|r| {
            json!({
                "rank": r.rank,
                "studentId": r.item.student_id,
                "studentName": names.get(&r.item.student_id),
                "averagePercentage": r.key.average_percentage,
                "totalMarks": r.key.total_marks,
                "points": r.item.points,
                "uniqueExamsCount": r.item.exam_count,
                "recordCount": r.item.record_count,
                "excellenceRate": r.item.excellence_rate,
            })
        })
        .collect()
}

/// All-time standings. Without a class filter the points column is the
/// stored lifetime figure; with one, points are rebuilt from that
/// class's exams plus class-scoped monthly win credit so the board
/// reflects only what happened inside the class.
fn handle_overall(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_number = optional_i64(req, "classNumber");
    let exams = match store::load_exams(
        conn,
        &ExamFilter {
            class_number,
            ..ExamFilter::default()
        },
    ) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let names = match student_names(conn) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };

    let grouped = by_student(&exams);
    let mut keyed = Vec::with_capacity(grouped.len());
    for (student_id, set) in &grouped {
        let points = match class_number {
            None => match ledger::ledger_snapshot(conn, student_id) {
                Ok(s) => s.points_earned,
                Err(e) => return core_err(req, e),
            },
            Some(class) => {
                let exam_points: i64 =
                    set.iter().map(|e| scoring::exam_grade(e).points).sum();
                let wins =
                    match ledger::monthly_wins(conn, student_id, Some(class), today()) {
                        Ok(w) => w,
                        Err(e) => return core_err(req, e),
                    };
                exam_points + ledger::MONTHLY_WIN_BONUS * wins
            }
        };
        let owned: Vec<ExamRecord> = set.iter().map(|e| (*e).clone()).collect();
        let stats = scoring::aggregate(&owned);
        keyed.push((
            ledger::rank_key(set),
            BoardEntry {
                student_id: student_id.clone(),
                points,
                exam_count: stats.unique_count,
                record_count: set.len(),
                excellence_rate: scoring::excellence_rate(&owned, stats.unique_count),
            },
        ));
    }
    let ranked = scoring::rank_descending(keyed);
    ok(
        &req.id,
        json!({ "entries": board_json(&ranked, &names, ranked.len()) }),
    )
}

fn handle_subjects(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let exams = match store::load_exams(conn, &ExamFilter::default()) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let names = match student_names(conn) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let subjects: Vec<(String, String)> = {
        let mut stmt = match conn.prepare("SELECT id, name FROM subjects ORDER BY name") {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        match rows {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let boards: Vec<serde_json::Value> = subjects
        .iter()
        .map(|(subject_id, subject_name)| {
            let subset: Vec<ExamRecord> = exams
                .iter()
                .filter(|e| e.subject_id == *subject_id)
                .cloned()
                .collect();
            let grouped = by_student(&subset);
            let keyed: Vec<_> = grouped
                .iter()
                .map(|(student_id, set)| {
                    let owned: Vec<ExamRecord> = set.iter().map(|e| (*e).clone()).collect();
                    let stats = scoring::aggregate(&owned);
                    (
                        ledger::rank_key(set),
                        BoardEntry {
                            student_id: student_id.clone(),
                            points: set.iter().map(|e| scoring::exam_grade(e).points).sum(),
                            exam_count: stats.unique_count,
                            record_count: set.len(),
                            excellence_rate: scoring::excellence_rate(
                                &owned,
                                stats.unique_count,
                            ),
                        },
                    )
                })
                .collect();
            let ranked = scoring::rank_descending(keyed);
            let best_score = ranked.first().map(|r| r.key.average_percentage);
            json!({
                "subjectId": subject_id,
                "subjectName": subject_name,
                "bestScore": best_score,
                "entries": board_json(&ranked, &names, BOARD_LIMIT),
            })
        })
        .collect();
    ok(&req.id, json!({ "subjects": boards }))
}

/// One board per completed month, newest first. Points here are the
/// month's exam points only; the 40-point win credit lands on the
/// lifetime ledger, not on this view.
fn handle_monthly(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_number = optional_i64(req, "classNumber");
    let exams = match store::load_exams(
        conn,
        &ExamFilter {
            class_number,
            ..ExamFilter::default()
        },
    ) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let names = match student_names(conn) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let months = match store::exam_months(conn, class_number) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };

    let now = today();
    let boards: Vec<serde_json::Value> = months
        .into_iter()
        .filter(|&(y, m)| ledger::month_has_passed(y, m, now))
        .map(|(year, month)| {
            use chrono::Datelike;
            let subset: Vec<ExamRecord> = exams
                .iter()
                .filter(|e| e.date.year() == year && e.date.month() == month)
                .cloned()
                .collect();
            let grouped = by_student(&subset);
            let keyed: Vec<_> = grouped
                .iter()
                .map(|(student_id, set)| {
                    let owned: Vec<ExamRecord> = set.iter().map(|e| (*e).clone()).collect();
                    let stats = scoring::aggregate(&owned);
                    (
                        ledger::rank_key(set),
                        BoardEntry {
                            student_id: student_id.clone(),
                            points: set.iter().map(|e| scoring::exam_grade(e).points).sum(),
                            exam_count: stats.unique_count,
                            record_count: set.len(),
                            excellence_rate: scoring::excellence_rate(
                                &owned,
                                stats.unique_count,
                            ),
                        },
                    )
                })
                .collect();
            let ranked = scoring::rank_descending(keyed);
            json!({
                "month": format!("{:04}-{:02}", year, month),
                "label": store::month_label(year, month),
                "entries": board_json(&ranked, &names, BOARD_LIMIT),
            })
        })
        .collect();
    ok(&req.id, json!({ "months": boards }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "leaderboard.overall" => Some(handle_overall(state, req)),
        "leaderboard.subjects" => Some(handle_subjects(state, req)),
        "leaderboard.monthly" => Some(handle_monthly(state, req)),
        _ => None,
    }
}
