use chrono::NaiveDate;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};

use crate::scoring::CoreError;

#[derive(Debug, Clone)]
pub struct ExamRecord {
    pub id: String,
    pub student_id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub exam_type_id: String,
    pub exam_type_name: String,
    pub date: NaiveDate,
    pub chapter: Option<String>,
    pub class_number: i64,
    pub total_marks: i64,
    pub mark_obtained: i64,
    pub group_id: Option<String>,
    pub exam_no: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ExamFilter {
    pub student_id: Option<String>,
    pub subject_id: Option<String>,
    pub exam_type_id: Option<String>,
    pub class_number: Option<i64>,
    /// Calendar (year, month) restriction against the exam date.
    pub month: Option<(i32, u32)>,
}

fn db_err(e: impl std::fmt::Display) -> CoreError {
    CoreError::new("db_query_failed", e.to_string())
}

fn parse_date(raw: &str) -> Result<NaiveDate, CoreError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| CoreError::new("bad_date", format!("invalid stored date: {}", raw)))
}

/// Enumerate exam records matching the filter, newest first. Unknown
/// ids simply match nothing; read paths stay resilient to deleted
/// entities.
pub fn load_exams(conn: &Connection, filter: &ExamFilter) -> Result<Vec<ExamRecord>, CoreError> {
    let mut sql = String::from(
        "SELECT e.id, e.student_id, e.subject_id, s.name, e.exam_type_id, t.name,
                e.date, e.chapter, e.class_number, e.total_marks, e.mark_obtained,
                e.group_id, e.exam_no
         FROM exams e
         JOIN subjects s ON s.id = e.subject_id
         JOIN exam_types t ON t.id = e.exam_type_id
         WHERE 1=1",
    );
    let mut values: Vec<Value> = Vec::new();

    if let Some(student_id) = &filter.student_id {
        sql.push_str(" AND e.student_id = ?");
        values.push(Value::Text(student_id.clone()));
    }
    if let Some(subject_id) = &filter.subject_id {
        sql.push_str(" AND e.subject_id = ?");
        values.push(Value::Text(subject_id.clone()));
    }
    if let Some(exam_type_id) = &filter.exam_type_id {
        sql.push_str(" AND e.exam_type_id = ?");
        values.push(Value::Text(exam_type_id.clone()));
    }
    if let Some(class_number) = filter.class_number {
        sql.push_str(" AND e.class_number = ?");
        values.push(Value::Integer(class_number));
    }
    if let Some((year, month)) = filter.month {
        sql.push_str(" AND substr(e.date, 1, 7) = ?");
        values.push(Value::Text(format!("{:04}-{:02}", year, month)));
    }
    sql.push_str(" ORDER BY e.date DESC, e.exam_no DESC");

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params_from_iter(values), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, Option<String>>(7)?,
                r.get::<_, i64>(8)?,
                r.get::<_, i64>(9)?,
                r.get::<_, i64>(10)?,
                r.get::<_, Option<String>>(11)?,
                r.get::<_, i64>(12)?,
            ))
        })
        .map_err(db_err)?;

    let mut out = Vec::new();
    for row in rows {
        let (
            id,
            student_id,
            subject_id,
            subject_name,
            exam_type_id,
            exam_type_name,
            date,
            chapter,
            class_number,
            total_marks,
            mark_obtained,
            group_id,
            exam_no,
        ) = row.map_err(db_err)?;
        out.push(ExamRecord {
            id,
            student_id,
            subject_id,
            subject_name,
            exam_type_id,
            exam_type_name,
            date: parse_date(&date)?,
            chapter,
            class_number,
            total_marks,
            mark_obtained,
            group_id,
            exam_no,
        });
    }
    Ok(out)
}

pub fn load_student_exams(
    conn: &Connection,
    student_id: &str,
) -> Result<Vec<ExamRecord>, CoreError> {
    load_exams(
        conn,
        &ExamFilter {
            student_id: Some(student_id.to_string()),
            ..ExamFilter::default()
        },
    )
}

/// Logical exam identity for a new record. A non-empty group_id reuses
/// the exam_no of any existing member of the same bulk batch, so rows
/// inserted one at a time still converge on one shared number;
/// otherwise the identifier space advances by max+1. Must run inside
/// the insert's transaction to keep two concurrent batches from
/// racing on the max.
pub fn next_exam_no(conn: &Connection, group_id: Option<&str>) -> Result<i64, CoreError> {
    if let Some(group) = group_id {
        if !group.trim().is_empty() {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT exam_no FROM exams WHERE group_id = ? LIMIT 1",
                    [group],
                    |r| r.get(0),
                )
                .optional()
                .map_err(db_err)?;
            if let Some(no) = existing {
                return Ok(no);
            }
        }
    }
    conn.query_row("SELECT COALESCE(MAX(exam_no), 0) + 1 FROM exams", [], |r| {
        r.get(0)
    })
    .map_err(db_err)
}

#[derive(Debug, Clone)]
pub struct NewExam {
    pub student_id: String,
    pub subject_id: String,
    pub exam_type_id: String,
    pub date: NaiveDate,
    pub chapter: Option<String>,
    pub class_number: i64,
    pub total_marks: i64,
    pub mark_obtained: i64,
    pub group_id: Option<String>,
    /// None means assign via next_exam_no.
    pub exam_no: Option<i64>,
}

pub fn insert_exam(conn: &Connection, exam: &NewExam) -> Result<(String, i64), CoreError> {
    let exam_no = match exam.exam_no {
        Some(no) => no,
        None => next_exam_no(conn, exam.group_id.as_deref())?,
    };
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO exams(id, student_id, subject_id, exam_type_id, date, chapter,
                           class_number, total_marks, mark_obtained, group_id, exam_no, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        (
            &id,
            &exam.student_id,
            &exam.subject_id,
            &exam.exam_type_id,
            exam.date.format("%Y-%m-%d").to_string(),
            &exam.chapter,
            exam.class_number,
            exam.total_marks,
            exam.mark_obtained,
            &exam.group_id,
            exam_no,
        ),
    )
    .map_err(db_err)?;
    Ok((id, exam_no))
}

pub fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, CoreError> {
    row_exists(conn, "SELECT 1 FROM students WHERE id = ?", student_id)
}

pub fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, CoreError> {
    row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", subject_id)
}

fn row_exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, CoreError> {
    conn.query_row(sql, [id], |_| Ok(()))
        .optional()
        .map(|v| v.is_some())
        .map_err(db_err)
}

/// Find-or-create an exam type by its (trimmed) name.
pub fn exam_type_id_for_name(conn: &Connection, name: &str) -> Result<String, CoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(CoreError::new("bad_params", "exam type name must not be empty"));
    }
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM exam_types WHERE name = ?",
            [trimmed],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if let Some(id) = existing {
        return Ok(id);
    }
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO exam_types(id, name, created_at) VALUES (?, ?, datetime('now'))",
        (&id, trimmed),
    )
    .map_err(db_err)?;
    Ok(id)
}

/// Distinct (year, month) pairs present in the exam table, newest
/// first, optionally restricted to one class number.
pub fn exam_months(
    conn: &Connection,
    class_number: Option<i64>,
) -> Result<Vec<(i32, u32)>, CoreError> {
    let (sql, values): (&str, Vec<Value>) = match class_number {
        Some(n) => (
            "SELECT DISTINCT substr(date, 1, 7) FROM exams WHERE class_number = ?
             ORDER BY 1 DESC",
            vec![Value::Integer(n)],
        ),
        None => (
            "SELECT DISTINCT substr(date, 1, 7) FROM exams ORDER BY 1 DESC",
            Vec::new(),
        ),
    };
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params_from_iter(values), |r| r.get::<_, String>(0))
        .map_err(db_err)?;

    let mut out = Vec::new();
    for row in rows {
        let ym = row.map_err(db_err)?;
        let (year, month) = ym
            .split_once('-')
            .ok_or_else(|| CoreError::new("bad_date", format!("invalid stored month: {}", ym)))?;
        let year: i32 = year
            .parse()
            .map_err(|_| CoreError::new("bad_date", format!("invalid stored year: {}", ym)))?;
        let month: u32 = month
            .parse()
            .map_err(|_| CoreError::new("bad_date", format!("invalid stored month: {}", ym)))?;
        out.push((year, month));
    }
    Ok(out)
}

pub fn month_label(year: i32, month: u32) -> String {
    const MONTH_NAMES: [&str; 12] = [
        "January",
        "February",
        "March",
        "April",
        "May",
        "June",
        "July",
        "August",
        "September",
        "October",
        "November",
        "December",
    ];
    let name = MONTH_NAMES
        .get((month as usize).saturating_sub(1))
        .copied()
        .unwrap_or("Unknown");
    format!("{} {}", name, year)
}
