use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::handlers::{core_err, db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use crate::scoring::{self, CoreError};
use crate::store::{self, ExamFilter, ExamRecord};

fn load_names(conn: &Connection, table: &str) -> Result<Vec<(String, String)>, CoreError> {
    let sql = format!("SELECT id, name FROM {} ORDER BY name", table);
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| CoreError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CoreError::new("db_query_failed", e.to_string()))
}

/// Top student in one subject by weighted average (no tiebreak: first
/// of the tie block after ranking).
fn best_student(subject_exams: &[&ExamRecord]) -> Option<String> {
    let mut per_student: HashMap<&str, Vec<&ExamRecord>> = HashMap::new();
    for e in subject_exams {
        per_student.entry(e.student_id.as_str()).or_default().push(e);
    }
    let ranked = scoring::rank_descending(
        per_student
            .iter()
            .map(|(id, set)| (ledger::rank_key(set), id.to_string()))
            .collect(),
    );
    ranked.first().map(|r| r.item.clone())
}

fn handle_create_subject(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, created_at) VALUES (?, ?, datetime('now'))",
        (&id, &name),
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "subjectId": id }))
}

fn handle_list_subjects(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let subjects = match load_names(conn, "subjects") {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let all_exams = match store::load_exams(conn, &ExamFilter::default()) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let student_names: HashMap<String, String> = match load_names(conn, "students") {
        Ok(v) => v.into_iter().collect(),
        Err(e) => return core_err(req, e),
    };

    let rows: Vec<serde_json::Value> = subjects
        .iter()
        .map(|(id, name)| {
            let subject_exams: Vec<&ExamRecord> = all_exams
                .iter()
                .filter(|e| e.subject_id == *id)
                .collect();
            let stats = scoring::aggregate(
                &subject_exams.iter().map(|e| (*e).clone()).collect::<Vec<_>>(),
            );
            let best = best_student(&subject_exams);
            let best_name = best.as_ref().and_then(|b| student_names.get(b));
            json!({
                "id": id,
                "name": name,
                "averagePercentage": stats.average_percentage,
                "totalExams": stats.unique_count,
                "bestStudentName": best_name,
                "bestStudentId": best,
            })
        })
        .collect();
    ok(&req.id, json!({ "subjects": rows }))
}

fn handle_create_exam_type(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match store::exam_type_id_for_name(conn, &name) {
        Ok(id) => ok(&req.id, json!({ "examTypeId": id })),
        Err(e) => core_err(req, e),
    }
}

fn handle_list_exam_types(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let types = match load_names(conn, "exam_types") {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let all_exams = match store::load_exams(conn, &ExamFilter::default()) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let rows: Vec<serde_json::Value> = types
        .iter()
        .map(|(id, name)| {
            let subset: Vec<ExamRecord> = all_exams
                .iter()
                .filter(|e| e.exam_type_id == *id)
                .cloned()
                .collect();
            let stats = scoring::aggregate(&subset);
            json!({
                "id": id,
                "name": name,
                "averagePercentage": stats.average_percentage,
                "totalExams": stats.unique_count,
            })
        })
        .collect();
    ok(&req.id, json!({ "examTypes": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(handle_create_subject(state, req)),
        "subjects.list" => Some(handle_list_subjects(state, req)),
        "examTypes.create" => Some(handle_create_exam_type(state, req)),
        "examTypes.list" => Some(handle_list_exam_types(state, req)),
        _ => None,
    }
}
