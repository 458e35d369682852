use chrono::{Datelike, NaiveDate};
use rusqlite::Connection;
use std::collections::HashMap;

use crate::scoring::{self, CoreError, RankKey};
use crate::store::{self, ExamFilter, ExamRecord};

pub const MONTHLY_WIN_BONUS: i64 = 40;

fn db_err(e: impl std::fmt::Display) -> CoreError {
    CoreError::new("db_query_failed", e.to_string())
}

pub fn month_has_passed(year: i32, month: u32, today: NaiveDate) -> bool {
    year < today.year() || (year == today.year() && month < today.month())
}

fn by_student<'a>(exams: &'a [&'a ExamRecord]) -> HashMap<String, Vec<&'a ExamRecord>> {
    let mut grouped: HashMap<String, Vec<&ExamRecord>> = HashMap::new();
    for e in exams {
        grouped.entry(e.student_id.clone()).or_default().push(e);
    }
    grouped
}

pub fn rank_key(exams: &[&ExamRecord]) -> RankKey {
    let mut total_obtained = 0.0_f64;
    let mut total_possible = 0.0_f64;
    for e in exams {
        total_obtained += e.mark_obtained as f64;
        total_possible += e.total_marks as f64;
    }
    let average_percentage = if total_possible > 0.0 {
        100.0 * total_obtained / total_possible
    } else {
        0.0
    };
    RankKey {
        average_percentage,
        total_marks: total_obtained,
    }
}

/// Number of completed calendar months in which the student was (tied
/// for) first by (average %, total marks) among all students with
/// records that month. The current month never counts; it is still in
/// progress.
pub fn monthly_wins_over(exams: &[ExamRecord], student_id: &str, today: NaiveDate) -> i64 {
    let mut months: Vec<(i32, u32)> = exams
        .iter()
        .map(|e| (e.date.year(), e.date.month()))
        .filter(|&(y, m)| month_has_passed(y, m, today))
        .collect();
    months.sort_unstable();
    months.dedup();

    let mut wins = 0_i64;
    for (year, month) in months {
        let month_exams: Vec<&ExamRecord> = exams
            .iter()
            .filter(|e| e.date.year() == year && e.date.month() == month)
            .collect();
        let grouped = by_student(&month_exams);
        let Some(own) = grouped.get(student_id) else {
            continue;
        };
        let own_key = rank_key(own);
        let ranked = scoring::rank_descending(
            grouped
                .iter()
                .map(|(id, set)| (rank_key(set), id.clone()))
                .collect(),
        );
        if scoring::tied_for_top(&ranked, &own_key) {
            wins += 1;
        }
    }
    wins
}

pub fn monthly_wins(
    conn: &Connection,
    student_id: &str,
    class_number: Option<i64>,
    today: NaiveDate,
) -> Result<i64, CoreError> {
    let exams = store::load_exams(
        conn,
        &ExamFilter {
            class_number,
            ..ExamFilter::default()
        },
    )?;
    Ok(monthly_wins_over(&exams, student_id, today))
}

pub fn ensure_ledger(conn: &Connection, student_id: &str) -> Result<(), CoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO lifetime_points(student_id, points_earned, points_spent)
         VALUES (?, 0, 0)",
        [student_id],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Full reactive recomputation of points_earned from the student's
/// current exam set plus the monthly-win bonus. Runs after every exam
/// mutation touching the student; no incremental delta is ever
/// applied, so edits, deletes and bulk operations all land on the
/// same derivation. points_spent is left untouched.
pub fn recompute_points(
    conn: &Connection,
    student_id: &str,
    today: NaiveDate,
) -> Result<i64, CoreError> {
    let exams = store::load_student_exams(conn, student_id)?;
    let exam_points: i64 = exams.iter().map(|e| scoring::exam_grade(e).points).sum();
    let wins = monthly_wins(conn, student_id, None, today)?;
    let points_earned = exam_points + MONTHLY_WIN_BONUS * wins;

    ensure_ledger(conn, student_id)?;
    conn.execute(
        "UPDATE lifetime_points SET points_earned = ? WHERE student_id = ?",
        (points_earned, student_id),
    )
    .map_err(db_err)?;
    Ok(points_earned)
}

/// points_spent is the sum over the student's spend records; rerun on
/// every spend create/delete.
pub fn recompute_spent(conn: &Connection, student_id: &str) -> Result<i64, CoreError> {
    let total: i64 = conn
        .query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM points_spent WHERE student_id = ?",
            [student_id],
            |r| r.get(0),
        )
        .map_err(db_err)?;
    ensure_ledger(conn, student_id)?;
    conn.execute(
        "UPDATE lifetime_points SET points_spent = ? WHERE student_id = ?",
        (total, student_id),
    )
    .map_err(db_err)?;
    Ok(total)
}

#[derive(Debug, Clone, Copy)]
pub struct LedgerSnapshot {
    pub points_earned: i64,
    pub points_spent: i64,
}

impl LedgerSnapshot {
    pub fn points_remaining(&self) -> i64 {
        self.points_earned - self.points_spent
    }
}

pub fn ledger_snapshot(conn: &Connection, student_id: &str) -> Result<LedgerSnapshot, CoreError> {
    ensure_ledger(conn, student_id)?;
    conn.query_row(
        "SELECT points_earned, points_spent FROM lifetime_points WHERE student_id = ?",
        [student_id],
        |r| {
            Ok(LedgerSnapshot {
                points_earned: r.get(0)?,
                points_spent: r.get(1)?,
            })
        },
    )
    .map_err(db_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::store::NewExam;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace(prefix: &str) -> PathBuf {
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

    fn open(prefix: &str) -> Connection {
        db::open_db(&temp_workspace(prefix)).expect("open db")
    }

    fn seed_student(conn: &Connection, id: &str, name: &str) {
        conn.execute(
            "INSERT INTO students(id, name, created_at) VALUES (?, ?, datetime('now'))",
            (id, name),
        )
        .expect("insert student");
    }

    fn seed_subject(conn: &Connection, id: &str, name: &str) {
        conn.execute(
            "INSERT INTO subjects(id, name, created_at) VALUES (?, ?, datetime('now'))",
            (id, name),
        )
        .expect("insert subject");
    }

    fn add_exam(
        conn: &Connection,
        student_id: &str,
        date: &str,
        mark: i64,
        total: i64,
        group_id: Option<&str>,
    ) -> i64 {
        let exam_type_id = store::exam_type_id_for_name(conn, "CQ").expect("exam type");
        let (_, exam_no) = store::insert_exam(
            conn,
            &NewExam {
                student_id: student_id.to_string(),
                subject_id: "sub1".to_string(),
                exam_type_id,
                date: NaiveDate::parse_from_str(date, "%Y-%m-%d").expect("date"),
                chapter: None,
                class_number: 1,
                total_marks: total,
                mark_obtained: mark,
                group_id: group_id.map(|g| g.to_string()),
                exam_no: None,
            },
        )
        .expect("insert exam");
        exam_no
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 15).expect("date")
    }

    #[test]
    fn exam_no_assignment_reuses_group_and_increments() {
        let conn = open("restrack-ledger-examno");
        seed_student(&conn, "s1", "Amina");
        seed_subject(&conn, "sub1", "Physics");

        let a = add_exam(&conn, "s1", "2025-03-01", 8, 10, Some("bulk-x"));
        let b = add_exam(&conn, "s1", "2025-03-01", 9, 10, Some("bulk-x"));
        let c = add_exam(&conn, "s1", "2025-03-01", 7, 10, Some("bulk-x"));
        assert_eq!(a, 1);
        assert_eq!(b, a);
        assert_eq!(c, a);

        let d = add_exam(&conn, "s1", "2025-03-02", 6, 10, None);
        assert_eq!(d, a + 1);
    }

    #[test]
    fn recompute_sums_exam_points_and_monthly_bonus() {
        let conn = open("restrack-ledger-recompute");
        seed_student(&conn, "s1", "Amina");
        seed_student(&conn, "s2", "Rafi");
        seed_subject(&conn, "sub1", "Physics");

        // s1 tops March and April outright; s2 trails in both.
        add_exam(&conn, "s1", "2025-03-10", 90, 100, None); // Superb +20
        add_exam(&conn, "s2", "2025-03-12", 60, 100, None); // Average 0
        add_exam(&conn, "s1", "2025-04-08", 80, 100, None); // Good +15
        add_exam(&conn, "s2", "2025-04-09", 55, 100, None); // Average 0

        let earned = recompute_points(&conn, "s1", today()).expect("recompute");
        // 20 + 15 exam points, two monthly wins at 40 apiece.
        assert_eq!(earned, 35 + 80);

        let again = recompute_points(&conn, "s1", today()).expect("recompute twice");
        assert_eq!(again, earned);
    }

    #[test]
    fn current_month_never_earns_win_credit() {
        let conn = open("restrack-ledger-current-month");
        seed_student(&conn, "s1", "Amina");
        seed_subject(&conn, "sub1", "Physics");

        // Sole performer in the in-progress month.
        add_exam(&conn, "s1", "2025-06-10", 95, 100, None); // Superb +20

        let earned = recompute_points(&conn, "s1", today()).expect("recompute");
        assert_eq!(earned, 20);
        assert_eq!(monthly_wins(&conn, "s1", None, today()).expect("wins"), 0);
    }

    #[test]
    fn tied_students_both_win_the_month() {
        let conn = open("restrack-ledger-tie");
        seed_student(&conn, "s1", "Amina");
        seed_student(&conn, "s2", "Rafi");
        seed_subject(&conn, "sub1", "Physics");

        add_exam(&conn, "s1", "2025-05-05", 45, 50, None);
        add_exam(&conn, "s2", "2025-05-06", 45, 50, None);

        assert_eq!(monthly_wins(&conn, "s1", None, today()).expect("wins"), 1);
        assert_eq!(monthly_wins(&conn, "s2", None, today()).expect("wins"), 1);
    }

    #[test]
    fn same_average_lower_total_is_not_a_win() {
        let conn = open("restrack-ledger-tiebreak");
        seed_student(&conn, "s1", "Amina");
        seed_student(&conn, "s2", "Rafi");
        seed_subject(&conn, "sub1", "Physics");

        // Both at 90%, but s1 carries more total marks.
        add_exam(&conn, "s1", "2025-05-05", 90, 100, None);
        add_exam(&conn, "s2", "2025-05-06", 45, 50, None);

        assert_eq!(monthly_wins(&conn, "s1", None, today()).expect("wins"), 1);
        assert_eq!(monthly_wins(&conn, "s2", None, today()).expect("wins"), 0);
    }

    #[test]
    fn spent_recompute_sums_records() {
        let conn = open("restrack-ledger-spent");
        seed_student(&conn, "s1", "Amina");
        for (amount, desc) in [(10, "sticker"), (5, "pencil")] {
            conn.execute(
                "INSERT INTO points_spent(id, student_id, amount, description, spend_date, created_at)
                 VALUES (?, ?, ?, ?, date('now'), datetime('now'))",
                (uuid::Uuid::new_v4().to_string(), "s1", amount, desc),
            )
            .expect("insert spend");
        }
        assert_eq!(recompute_spent(&conn, "s1").expect("recompute spent"), 15);
        let snapshot = ledger_snapshot(&conn, "s1").expect("snapshot");
        assert_eq!(snapshot.points_spent, 15);
        assert_eq!(snapshot.points_remaining(), -15);
    }
}
