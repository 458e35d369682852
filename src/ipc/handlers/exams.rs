use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::handlers::{
    core_err, db_conn, optional_i64, optional_month, optional_str, required_date, required_i64,
    required_str, today,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use crate::scoring::{self, CoreError};
use crate::store::{self, ExamFilter, ExamRecord, NewExam};

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

fn load_exam_row(conn: &Connection, exam_id: &str) -> Result<Option<ExamRecord>, CoreError> {
    let row: Option<String> = conn
        .query_row("SELECT student_id FROM exams WHERE id = ?", [exam_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| CoreError::new("db_query_failed", e.to_string()))?;
    if row.is_none() {
        return Ok(None);
    }
    // Re-read through the joined loader so names come along.
    let mut all = store::load_exams(conn, &ExamFilter::default())?;
    all.retain(|e| e.id == exam_id);
    Ok(all.into_iter().next())
}

fn filter_from_request(req: &Request) -> Result<ExamFilter, serde_json::Value> {
    Ok(ExamFilter {
        student_id: optional_str(req, "studentId"),
        subject_id: optional_str(req, "subjectId"),
        exam_type_id: optional_str(req, "examTypeId"),
        class_number: optional_i64(req, "classNumber"),
        month: optional_month(req, "month")?,
    })
}

struct RecordCommon {
    subject_id: String,
    exam_type_id: String,
    date: NaiveDate,
    chapter: Option<String>,
    class_number: i64,
    total_marks: i64,
}

fn parse_record_common(
    conn: &Connection,
    req: &Request,
) -> Result<RecordCommon, serde_json::Value> {
    let subject_id = required_str(req, "subjectId")?;
    match store::subject_exists(conn, &subject_id) {
        Ok(true) => {}
        Ok(false) => return Err(err(&req.id, "not_found", "subject not found", None)),
        Err(e) => return Err(core_err(req, e)),
    }
    let exam_type_name = required_str(req, "examType")?;
    let exam_type_id =
        store::exam_type_id_for_name(conn, &exam_type_name).map_err(|e| core_err(req, e))?;
    let date = required_date(req, "date")?;
    let total_marks = required_i64(req, "totalMarks")?;
    if total_marks <= 0 {
        return Err(err(
            &req.id,
            "invalid_marks",
            "totalMarks must be positive",
            None,
        ));
    }
    Ok(RecordCommon {
        subject_id,
        exam_type_id,
        date,
        chapter: optional_str(req, "chapter"),
        class_number: optional_i64(req, "classNumber").unwrap_or(1),
        total_marks,
    })
}

fn handle_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match store::student_exists(conn, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return core_err(req, e),
    }
    let common = match parse_record_common(conn, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mark_obtained = match required_i64(req, "markObtained") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // Identity assignment and ledger recompute commit atomically with
    // the insert.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let inserted = store::insert_exam(
        &tx,
        &NewExam {
            student_id: student_id.clone(),
            subject_id: common.subject_id,
            exam_type_id: common.exam_type_id,
            date: common.date,
            chapter: common.chapter,
            class_number: common.class_number,
            total_marks: common.total_marks,
            mark_obtained,
            group_id: optional_str(req, "groupId"),
            exam_no: optional_i64(req, "examNo"),
        },
    );
    let (exam_id, exam_no) = match inserted {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    if let Err(e) = ledger::recompute_points(&tx, &student_id, today()) {
        return core_err(req, e);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    match load_exam_row(conn, &exam_id) {
        Ok(Some(row)) => ok(&req.id, json!({ "exam": exam_json(&row), "examNo": exam_no })),
        Ok(None) => err(&req.id, "db_query_failed", "inserted exam vanished", None),
        Err(e) => core_err(req, e),
    }
}

fn handle_record_bulk(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let common = match parse_record_common(conn, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(marks) = req.params.get("marks").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing marks array", None);
    };
    if marks.is_empty() {
        return err(&req.id, "bad_params", "marks must not be empty", None);
    }

    let mut parsed: Vec<(String, i64)> = Vec::with_capacity(marks.len());
    for (i, m) in marks.iter().enumerate() {
        let Some(student_id) = m.get("studentId").and_then(|v| v.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                format!("marks[{}] missing studentId", i),
                None,
            );
        };
        let Some(mark_obtained) = m.get("markObtained").and_then(|v| v.as_i64()) else {
            return err(
                &req.id,
                "bad_params",
                format!("marks[{}] missing markObtained", i),
                None,
            );
        };
        match store::student_exists(conn, student_id) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    format!("student not found: {}", student_id),
                    None,
                )
            }
            Err(e) => return core_err(req, e),
        }
        parsed.push((student_id.to_string(), mark_obtained));
    }

    // One batch, one group token, one logical exam number.
    let group_id = format!(
        "bulk_{}_{}",
        chrono::Local::now().format("%Y%m%d%H%M%S"),
        &Uuid::new_v4().simple().to_string()[..8]
    );

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let exam_no = match optional_i64(req, "examNo") {
        Some(no) => no,
        None => match store::next_exam_no(&tx, Some(&group_id)) {
            Ok(no) => no,
            Err(e) => return core_err(req, e),
        },
    };
    let mut created = 0usize;
    for (student_id, mark_obtained) in &parsed {
        let inserted = store::insert_exam(
            &tx,
            &NewExam {
                student_id: student_id.clone(),
                subject_id: common.subject_id.clone(),
                exam_type_id: common.exam_type_id.clone(),
                date: common.date,
                chapter: common.chapter.clone(),
                class_number: common.class_number,
                total_marks: common.total_marks,
                mark_obtained: *mark_obtained,
                group_id: Some(group_id.clone()),
                exam_no: Some(exam_no),
            },
        );
        if let Err(e) = inserted {
            return core_err(req, e);
        }
        created += 1;
    }
    let touched: BTreeSet<&String> = parsed.iter().map(|(id, _)| id).collect();
    for student_id in touched {
        if let Err(e) = ledger::recompute_points(&tx, student_id, today()) {
            return core_err(req, e);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "groupId": group_id,
            "examNo": exam_no,
            "createdCount": created,
        }),
    )
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let current = match load_exam_row(conn, &exam_id) {
        Ok(Some(row)) => row,
        Ok(None) => return err(&req.id, "not_found", "exam not found", None),
        Err(e) => return core_err(req, e),
    };

    let new_student_id = optional_str(req, "studentId").unwrap_or_else(|| current.student_id.clone());
    if new_student_id != current.student_id {
        match store::student_exists(conn, &new_student_id) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "student not found", None),
            Err(e) => return core_err(req, e),
        }
    }
    let new_subject_id = optional_str(req, "subjectId").unwrap_or_else(|| current.subject_id.clone());
    if new_subject_id != current.subject_id {
        match store::subject_exists(conn, &new_subject_id) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "subject not found", None),
            Err(e) => return core_err(req, e),
        }
    }
    let new_exam_type_id = match optional_str(req, "examType") {
        Some(name) => match store::exam_type_id_for_name(conn, &name) {
            Ok(id) => id,
            Err(e) => return core_err(req, e),
        },
        None => current.exam_type_id.clone(),
    };
    let new_date = match optional_str(req, "date") {
        Some(raw) => match crate::ipc::handlers::parse_date(req, "date", &raw) {
            Ok(d) => d,
            Err(resp) => return resp,
        },
        None => current.date,
    };
    let new_total = optional_i64(req, "totalMarks").unwrap_or(current.total_marks);
    if new_total <= 0 {
        return err(&req.id, "invalid_marks", "totalMarks must be positive", None);
    }
    let new_mark = optional_i64(req, "markObtained").unwrap_or(current.mark_obtained);
    let new_class = optional_i64(req, "classNumber").unwrap_or(current.class_number);
    let new_chapter = optional_str(req, "chapter").or_else(|| current.chapter.clone());

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let updated = tx.execute(
        "UPDATE exams SET student_id = ?, subject_id = ?, exam_type_id = ?, date = ?,
                          chapter = ?, class_number = ?, total_marks = ?, mark_obtained = ?
         WHERE id = ?",
        (
            &new_student_id,
            &new_subject_id,
            &new_exam_type_id,
            new_date.format("%Y-%m-%d").to_string(),
            &new_chapter,
            new_class,
            new_total,
            new_mark,
            &exam_id,
        ),
    );
    if let Err(e) = updated {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    if let Err(e) = ledger::recompute_points(&tx, &current.student_id, today()) {
        return core_err(req, e);
    }
    if new_student_id != current.student_id {
        if let Err(e) = ledger::recompute_points(&tx, &new_student_id, today()) {
            return core_err(req, e);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    match load_exam_row(conn, &exam_id) {
        Ok(Some(row)) => ok(&req.id, json!({ "exam": exam_json(&row) })),
        Ok(None) => err(&req.id, "db_query_failed", "updated exam vanished", None),
        Err(e) => core_err(req, e),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let current = match load_exam_row(conn, &exam_id) {
        Ok(Some(row)) => row,
        Ok(None) => return err(&req.id, "not_found", "exam not found", None),
        Err(e) => return core_err(req, e),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM exams WHERE id = ?", [&exam_id]) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    if let Err(e) = ledger::recompute_points(&tx, &current.student_id, today()) {
        return core_err(req, e);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "deleted": true }))
}

fn handle_delete_bulk(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let filter = match filter_from_request(req) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let matching = match store::load_exams(conn, &filter) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    for e in &matching {
        if let Err(db_e) = tx.execute("DELETE FROM exams WHERE id = ?", [&e.id]) {
            return err(&req.id, "db_query_failed", db_e.to_string(), None);
        }
    }
    let touched: BTreeSet<&str> = matching.iter().map(|e| e.student_id.as_str()).collect();
    for student_id in &touched {
        if let Err(e) = ledger::recompute_points(&tx, student_id, today()) {
            return core_err(req, e);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({
            "deletedCount": matching.len(),
            "studentsTouched": touched.len(),
        }),
    )
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let stats = scoring::aggregate(&exams);

    let mut highest = 0.0_f64;
    let mut lowest = 0.0_f64;
    if !exams.is_empty() {
        highest = f64::MIN;
        lowest = f64::MAX;
        for e in &exams {
            let p = scoring::percentage(e.mark_obtained, e.total_marks);
            highest = highest.max(p);
            lowest = lowest.min(p);
        }
    }

    let months = match store::exam_months(conn, filter.class_number) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let available_months: Vec<serde_json::Value> = months
        .into_iter()
        .map(|(year, month)| {
            json!({
                "value": format!("{:04}-{:02}", year, month),
                "label": store::month_label(year, month),
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "exams": exams.iter().map(exam_json).collect::<Vec<_>>(),
            "uniqueExamsCount": stats.unique_count,
            "totalRecordsCount": stats.record_count,
            "averagePercentage": stats.average_percentage,
            "highestPercentage": highest,
            "lowestPercentage": lowest,
            "availableMonths": available_months,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.record" => Some(handle_record(state, req)),
        "exams.recordBulk" => Some(handle_record_bulk(state, req)),
        "exams.update" => Some(handle_update(state, req)),
        "exams.delete" => Some(handle_delete(state, req)),
        "exams.deleteBulk" => Some(handle_delete_bulk(state, req)),
        "exams.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
