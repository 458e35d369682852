use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::{core_err, db_conn, today};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use crate::store::{self, ExamFilter, NewExam};

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

fn handle_backup_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let workspace_path = req
        .params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            )
        }
    };
    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "dbSha256": export.db_sha256,
        }),
    )
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing inPath", None),
    };
    let workspace_path = req
        .params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }

    // Drop open handle before replacing the file.
    state.db = None;

    let import = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": src.to_string_lossy() })),
            )
        }
    };

    match db::open_db(&workspace_path) {
        Ok(conn) => {
            state.workspace = Some(workspace_path.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormatDetected": import.bundle_format_detected,
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", e.to_string(), None),
    }
}

const CSV_HEADER: &str =
    "student_id,student_name,subject_name,exam_type,date,class_number,total_marks,mark_obtained,chapter\n";

fn handle_export_exams_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let exams = match store::load_exams(conn, &ExamFilter::default()) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let names: std::collections::HashMap<String, String> = {
        let mut stmt = match conn.prepare("SELECT id, name FROM students") {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .and_then(|it| it.collect::<Result<std::collections::HashMap<_, _>, _>>());
        match rows {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let mut csv = String::from(CSV_HEADER);
    let rows_exported = exams.len();
    for e in &exams {
        let name = names.get(&e.student_id).map(String::as_str).unwrap_or("");
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{}\n",
            csv_quote(&e.student_id),
            csv_quote(name),
            csv_quote(&e.subject_name),
            csv_quote(&e.exam_type_name),
            e.date.format("%Y-%m-%d"),
            e.class_number,
            e.total_marks,
            e.mark_obtained,
            csv_quote(e.chapter.as_deref().unwrap_or("")),
        ));
    }

    let out = PathBuf::from(&out_path);
    if let Some(parent) = out.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            );
        }
    }
    if let Err(e) = std::fs::write(&out, csv) {
        return err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": out_path })),
        );
    }
    ok(
        &req.id,
        json!({ "ok": true, "rowsExported": rows_exported, "path": out_path }),
    )
}

struct ParsedExamRow {
    line_no: usize,
    student_id: String,
    subject_name: String,
    exam_type: String,
    date: NaiveDate,
    class_number: i64,
    total_marks: i64,
    mark_obtained: i64,
    chapter: Option<String>,
}

fn parse_exam_rows(text: &str) -> (Vec<ParsedExamRow>, Vec<serde_json::Value>, usize) {
    let mut rows = Vec::new();
    let mut warnings = Vec::new();
    let mut total = 0usize;
    for (line_no, raw_line) in text.lines().enumerate() {
        if line_no == 0 {
            continue;
        }
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        total += 1;
        let fields = parse_csv_record(line);
        if fields.len() < 8 {
            warnings.push(json!({
                "line": line_no + 1,
                "code": "bad_columns",
                "message": "expected at least 8 CSV columns"
            }));
            continue;
        }
        let date = match NaiveDate::parse_from_str(fields[4].trim(), "%Y-%m-%d") {
            Ok(d) => d,
            Err(_) => {
                warnings.push(json!({
                    "line": line_no + 1,
                    "code": "bad_date",
                    "message": "date must be formatted YYYY-MM-DD"
                }));
                continue;
            }
        };
        let class_number = fields[5].trim().parse::<i64>().unwrap_or(1);
        let total_marks = match fields[6].trim().parse::<i64>() {
            Ok(v) if v > 0 => v,
            _ => {
                warnings.push(json!({
                    "line": line_no + 1,
                    "code": "invalid_marks",
                    "message": "total_marks must be a positive integer"
                }));
                continue;
            }
        };
        let mark_obtained = match fields[7].trim().parse::<i64>() {
            Ok(v) => v,
            Err(_) => {
                warnings.push(json!({
                    "line": line_no + 1,
                    "code": "invalid_marks",
                    "message": "mark_obtained must be an integer"
                }));
                continue;
            }
        };
        let chapter = fields
            .get(8)
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(|c| c.to_string());
        rows.push(ParsedExamRow {
            line_no: line_no + 1,
            student_id: fields[0].trim().to_string(),
            subject_name: fields[2].trim().to_string(),
            exam_type: fields[3].trim().to_string(),
            date,
            class_number,
            total_marks,
            mark_obtained,
            chapter,
        });
    }
    (rows, warnings, total)
}

/// Re-ingest rows produced by exchange.exportExamsCsv. Bad rows are
/// skipped with a warning; good rows land in one transaction so a
/// database failure never applies half a file.
fn handle_import_exams_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing inPath", None),
    };
    let text = match std::fs::read_to_string(&in_path) {
        Ok(t) => t,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": in_path })),
            )
        }
    };

    let (parsed_rows, mut warnings, rows_total) = parse_exam_rows(&text);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut imported = 0usize;
    let mut skipped = 0usize;
    let mut touched: BTreeSet<String> = BTreeSet::new();
    for row in &parsed_rows {
        let student_ok = match store::student_exists(&tx, &row.student_id) {
            Ok(v) => v,
            Err(e) => return core_err(req, e),
        };
        if !student_ok {
            skipped += 1;
            warnings.push(json!({
                "line": row.line_no,
                "code": "missing_student",
                "message": "student_id does not exist"
            }));
            continue;
        }
        let subject_id: Option<String> = match tx
            .query_row(
                "SELECT id FROM subjects WHERE name = ?",
                [&row.subject_name],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let Some(subject_id) = subject_id else {
            skipped += 1;
            warnings.push(json!({
                "line": row.line_no,
                "code": "missing_subject",
                "message": "subject_name does not match any subject"
            }));
            continue;
        };
        let exam_type_id = match store::exam_type_id_for_name(&tx, &row.exam_type) {
            Ok(id) => id,
            Err(e) => return core_err(req, e),
        };
        let inserted = store::insert_exam(
            &tx,
            &NewExam {
                student_id: row.student_id.clone(),
                subject_id,
                exam_type_id,
                date: row.date,
                chapter: row.chapter.clone(),
                class_number: row.class_number,
                total_marks: row.total_marks,
                mark_obtained: row.mark_obtained,
                group_id: None,
                exam_no: None,
            },
        );
        if let Err(e) = inserted {
            return core_err(req, e);
        }
        touched.insert(row.student_id.clone());
        imported += 1;
    }
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
            "ok": true,
            "rowsTotal": rows_total,
            "rowsParsed": parsed_rows.len(),
            "imported": imported,
            "skipped": skipped,
            "warningsCount": warnings.len(),
            "warnings": warnings,
            "path": in_path,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_backup_export(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_backup_import(state, req)),
        "exchange.exportExamsCsv" => Some(handle_export_exams_csv(state, req)),
        "exchange.importExamsCsv" => Some(handle_import_exams_csv(state, req)),
        _ => None,
    }
}
