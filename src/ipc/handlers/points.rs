use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::handlers::{
    core_err, db_conn, optional_i64, optional_str, required_i64, required_str, today,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use crate::store;

const DESCRIPTION_MAX: usize = 15;

fn handle_spend(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let amount = match required_i64(req, "amount") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if amount <= 0 {
        return err(&req.id, "bad_params", "amount must be positive", None);
    }
    let description: String = optional_str(req, "description")
        .unwrap_or_default()
        .chars()
        .take(DESCRIPTION_MAX)
        .collect();
    let spend_date = match optional_str(req, "spendDate") {
        Some(raw) => match crate::ipc::handlers::parse_date(req, "spendDate", &raw) {
            Ok(d) => d,
            Err(resp) => return resp,
        },
        None => today(),
    };

    // Refresh earned before checking the balance so a stale ledger
    // never blocks a legitimate spend.
    if let Err(e) = ledger::recompute_points(conn, &student_id, today()) {
        return core_err(req, e);
    }
    let snapshot = match ledger::ledger_snapshot(conn, &student_id) {
        Ok(s) => s,
        Err(e) => return core_err(req, e),
    };
    if amount > snapshot.points_remaining() {
        return err(
            &req.id,
            "insufficient_points",
            "not enough points remaining",
            Some(json!({
                "pointsRemaining": snapshot.points_remaining(),
                "requested": amount,
            })),
        );
    }

    let spend_id = Uuid::new_v4().to_string();
    let inserted = conn.execute(
        "INSERT INTO points_spent(id, student_id, amount, description, spend_date, created_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        (
            &spend_id,
            &student_id,
            amount,
            &description,
            spend_date.format("%Y-%m-%d").to_string(),
        ),
    );
    if let Err(e) = inserted {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    let spent = match ledger::recompute_spent(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    ok(
        &req.id,
        json!({
            "spendId": spend_id,
            "pointsSpent": spent,
            "pointsRemaining": snapshot.points_earned - spent,
        }),
    )
}

fn handle_spend_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let spend_id = match required_str(req, "spendId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id: Option<String> = match conn
        .query_row(
            "SELECT student_id FROM points_spent WHERE id = ?",
            [&spend_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(student_id) = student_id else {
        return err(&req.id, "not_found", "spend record not found", None);
    };
    if let Err(e) = conn.execute("DELETE FROM points_spent WHERE id = ?", [&spend_id]) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    let spent = match ledger::recompute_spent(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let snapshot = match ledger::ledger_snapshot(conn, &student_id) {
        Ok(s) => s,
        Err(e) => return core_err(req, e),
    };
    ok(
        &req.id,
        json!({
            "deleted": true,
            "pointsSpent": spent,
            "pointsRemaining": snapshot.points_remaining(),
        }),
    )
}

fn handle_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let mut sql = String::from(
        "SELECT p.id, p.student_id, st.name, p.amount, p.description, p.spend_date
         FROM points_spent p
         JOIN students st ON st.id = p.student_id
         WHERE 1=1",
    );
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(student_id) = optional_str(req, "studentId") {
        sql.push_str(" AND p.student_id = ?");
        values.push(rusqlite::types::Value::Text(student_id));
    }
    if let Some(from) = optional_str(req, "dateFrom") {
        match crate::ipc::handlers::parse_date(req, "dateFrom", &from) {
            Ok(_) => {
                sql.push_str(" AND p.spend_date >= ?");
                values.push(rusqlite::types::Value::Text(from));
            }
            Err(resp) => return resp,
        }
    }
    if let Some(to) = optional_str(req, "dateTo") {
        match crate::ipc::handlers::parse_date(req, "dateTo", &to) {
            Ok(_) => {
                sql.push_str(" AND p.spend_date <= ?");
                values.push(rusqlite::types::Value::Text(to));
            }
            Err(resp) => return resp,
        }
    }
    if let Some(min) = optional_i64(req, "minAmount") {
        sql.push_str(" AND p.amount >= ?");
        values.push(rusqlite::types::Value::Integer(min));
    }
    sql.push_str(" ORDER BY p.spend_date DESC, p.created_at DESC");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(values), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let amounts: Vec<i64> = rows.iter().map(|r| r.3).collect();
    let total: i64 = amounts.iter().sum();
    let average = if amounts.is_empty() {
        0.0
    } else {
        total as f64 / amounts.len() as f64
    };
    let spends: Vec<serde_json::Value> = rows
        .iter()
        .map(|(id, student_id, student_name, amount, description, spend_date)| {
            json!({
                "id": id,
                "studentId": student_id,
                "studentName": student_name,
                "amount": amount,
                "description": description,
                "spendDate": spend_date,
            })
        })
        .collect();
    ok(
        &req.id,
        json!({
            "spends": spends,
            "totalSpent": total,
            "averageSpend": average,
            "highestSpend": amounts.iter().max().copied().unwrap_or(0),
            "lowestSpend": amounts.iter().min().copied().unwrap_or(0),
        }),
    )
}

fn handle_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let students: Vec<(String, String)> = {
        let mut stmt = match conn.prepare("SELECT id, name FROM students ORDER BY name") {
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

    let mut entries = Vec::with_capacity(students.len());
    for (id, name) in &students {
        let snapshot = match ledger::ledger_snapshot(conn, id) {
            Ok(s) => s,
            Err(e) => return core_err(req, e),
        };
        entries.push((id.clone(), name.clone(), snapshot));
    }
    entries.sort_by(|a, b| {
        b.2.points_earned
            .cmp(&a.2.points_earned)
            .then_with(|| a.1.cmp(&b.1))
    });

    let rows: Vec<serde_json::Value> = entries
        .iter()
        .map(|(id, name, snapshot)| {
            json!({
                "studentId": id,
                "studentName": name,
                "pointsEarned": snapshot.points_earned,
                "pointsSpent": snapshot.points_spent,
                "pointsRemaining": snapshot.points_remaining(),
            })
        })
        .collect();
    ok(&req.id, json!({ "students": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "points.spend" => Some(handle_spend(state, req)),
        "points.spendDelete" => Some(handle_spend_delete(state, req)),
        "points.history" => Some(handle_history(state, req)),
        "points.summary" => Some(handle_summary(state, req)),
        _ => None,
    }
}
